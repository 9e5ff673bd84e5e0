//! The worker: an isolated execution context that runs one compilation at a
//! time, paired bidirectionally with the root dispatcher (`spec.md` §4.C).
//!
//! Each worker owns a dedicated OS thread — the compilation engine is
//! treated as a blocking, synchronous function (`spec.md` §9,
//! "Blocking callbacks from a synchronous engine"), so a thread, not an
//! async task, is the natural execution context. A `catch_unwind` boundary
//! keeps an engine panic from taking down the dispatcher.

use crate::engine::{CompileEngine, EngineError, HostServices, RoundTrip};
use crate::logging::CompilationLogger;
use crate::proto_gen::host::inbound_message::Message as Inbound;
use crate::proto_gen::host::outbound_message::Message as Outbound;
use crate::proto_gen::host::{compile_response, CompileResponse, InboundMessage, OutboundMessage};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as blocking_mpsc;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// A handle the pool and dispatcher use to talk to a live worker. Both
/// `CompileRequest` forwarding and routed callback responses go through the
/// same inbound channel, matching `spec.md` §4.D ("deliver the entire
/// inbound message into the target worker's inbound channel").
pub struct Worker {
    pub compilation_id: u32,
    inbound_tx: blocking_mpsc::Sender<InboundMessage>,
}

impl Worker {
    pub fn send(&self, message: InboundMessage) -> Result<(), blocking_mpsc::SendError<InboundMessage>> {
        self.inbound_tx.send(message)
    }

    /// A standalone handle to this worker's inbound channel, for recording
    /// in the outstanding-request table (`spec.md` §3).
    pub fn sink(&self) -> blocking_mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }
}

/// Spawns a worker thread with a fresh `compilation_id`. The thread runs
/// until its inbound channel is dropped (process shutdown).
pub fn spawn(
    compilation_id: u32,
    engine: Arc<dyn CompileEngine>,
    outbound_tx: UnboundedSender<(u32, OutboundMessage)>,
) -> Worker {
    let (inbound_tx, inbound_rx) = blocking_mpsc::channel::<InboundMessage>();

    std::thread::Builder::new()
        .name(format!("worker-{compilation_id}"))
        .spawn(move || run(compilation_id, engine, outbound_tx, inbound_rx))
        .expect("failed to spawn worker thread");

    Worker {
        compilation_id,
        inbound_tx,
    }
}

fn run(
    compilation_id: u32,
    engine: Arc<dyn CompileEngine>,
    outbound_tx: UnboundedSender<(u32, OutboundMessage)>,
    inbound_rx: blocking_mpsc::Receiver<InboundMessage>,
) {
    while let Ok(message) = inbound_rx.recv() {
        let request = match message.message {
            Some(Inbound::CompileRequest(request)) => request,
            // A callback response arriving with nothing awaiting it can only
            // mean the dispatcher mis-routed; drop it rather than wedge.
            _ => continue,
        };

        let round_trip = WorkerRoundTrip {
            compilation_id,
            outbound_tx: outbound_tx.clone(),
            inbound_rx: &inbound_rx,
        };
        let logger = CompilationLogger::new(
            compilation_id,
            request.alert_color,
            request.alert_ascii,
            outbound_tx.clone(),
        );
        let services = HostServices::new(compilation_id, &round_trip, &logger);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.compile(&request, &services)));

        let result = match outcome {
            Ok(Ok(success)) => compile_response::Result::Success(success),
            Ok(Err(failure)) => compile_response::Result::Failure(failure.into_failure()),
            Err(panic) => {
                compile_response::Result::Failure(EngineError::internal(panic_message(panic)).into_failure())
            }
        };

        let response = OutboundMessage {
            message: Some(Outbound::CompileResponse(CompileResponse {
                id: 0, // The root dispatcher overwrites this with the request id.
                result: Some(result),
            })),
        };
        if outbound_tx.send((compilation_id, response)).is_err() {
            return; // Dispatcher is gone; nothing left to report to.
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "the compilation engine panicked".to_string()
    }
}

/// Implements the blocking callback round trip described in `spec.md` §4.C
/// step 3: emit on the shared outbound channel, then block on this worker's
/// own inbound channel for the matching response. The per-worker single-slot
/// invariant (§9) means the next message this thread receives is always
/// that response.
struct WorkerRoundTrip<'a> {
    compilation_id: u32,
    outbound_tx: UnboundedSender<(u32, OutboundMessage)>,
    inbound_rx: &'a blocking_mpsc::Receiver<InboundMessage>,
}

impl<'a> RoundTrip for WorkerRoundTrip<'a> {
    fn call(&self, message: Outbound) -> InboundMessage {
        let outbound = OutboundMessage {
            message: Some(message),
        };
        self.outbound_tx
            .send((self.compilation_id, outbound))
            .expect("dispatcher outbound channel closed mid-compilation");
        self.inbound_rx
            .recv()
            .expect("dispatcher inbound channel closed mid-compilation")
    }
}
