use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&log_level)
        .context("parsing LOG_LEVEL environment filter failed")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stylesheet_compiler_host::logging::stderr_layer())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let exit_code = runtime.block_on(stylesheet_compiler_host::run());

    // Shut down without waiting for the worker threads' blocking reads to
    // return; they are parked on channels that nothing will ever fill once
    // the dispatcher has exited.
    runtime.shutdown_background();

    std::process::exit(exit_code);
}
