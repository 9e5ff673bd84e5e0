//! A long-running stylesheet compiler host: speaks a length-delimited
//! binary protocol over stdio, multiplexes compilation jobs onto a bounded
//! pool of isolated workers, and brokers bidirectional callbacks between an
//! external host and the compilation engine. See `spec.md` §1.

pub mod codec;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod importer;
pub mod logging;
pub mod pool;
pub mod proto_gen;
pub mod version;
pub mod wire;
pub mod worker;

use crate::dispatcher::ExitOutcome;
use crate::engine::{BuiltinEngine, CompileEngine};
use clap::Parser;
use std::sync::Arc;

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_USAGE: i32 = 64;
pub const EXIT_PROTOCOL: i32 = 76;

/// `spec.md` §6.3: no arguments are permitted except `--version`.
#[derive(Parser, Debug)]
#[command(name = "stylesheet-compiler-host", disable_help_flag = true, disable_help_subcommand = true)]
pub struct Args {
    #[arg(long)]
    pub version: bool,
}

/// Runs the host to completion and returns the process exit code.
pub async fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(_) => {
            eprintln!("usage: stylesheet-compiler-host [--version]");
            return EXIT_USAGE;
        }
    };

    if args.version {
        print_version();
        return EXIT_CLEAN;
    }

    let engine: Arc<dyn CompileEngine> = Arc::new(BuiltinEngine);
    match dispatcher::run(tokio::io::stdin(), tokio::io::stdout(), engine).await {
        ExitOutcome::Clean => EXIT_CLEAN,
        ExitOutcome::Protocol => EXIT_PROTOCOL,
    }
}

fn print_version() {
    let response = version::response(0);
    let json = serde_json::json!({
        "protocolVersion": response.protocol_version,
        "compilerVersion": response.compiler_version,
        "implementationVersion": response.implementation_version,
        "implementationName": response.implementation_name,
    });
    println!("{}", serde_json::to_string_pretty(&json).expect("version JSON always serializes"));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rejects_unknown_arguments() {
        let err = Args::try_parse_from(["stylesheet-compiler-host", "--bogus"]).unwrap_err();
        assert!(err.to_string().len() > 0);
    }

    #[test]
    fn test_accepts_version_flag() {
        let args = Args::try_parse_from(["stylesheet-compiler-host", "--version"]).unwrap();
        assert!(args.version);
    }
}
