//! The root dispatcher (`spec.md` §4.D): owns stdio, parses inbound frames,
//! answers `VersionRequest` directly, forwards `CompileRequest` to a pooled
//! worker, and routes callback responses back to the worker awaiting them.
//!
//! The dispatcher is single-threaded and cooperative, but it must never let
//! a saturated worker pool block it from draining the outbound channel —
//! that channel is exactly what frees up workers. So acquiring a worker for
//! a new compilation runs as its own task; the main loop only blocks on
//! whichever of (next inbound frame, next outbound message, next acquired
//! worker) is ready first.

use crate::codec;
use crate::engine::CompileEngine;
use crate::error::{ErrorKind, ProtocolError};
use crate::pool::WorkerPool;
use crate::proto_gen::host::inbound_message::Message as Inbound;
use crate::proto_gen::host::outbound_message::Message as Outbound;
use crate::proto_gen::host::{InboundMessage, OutboundMessage};
use crate::version;
use crate::wire;
use crate::worker::Worker;
use futures::StreamExt;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::mpsc as blocking_mpsc;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::unbounded_channel;

pub enum ExitOutcome {
    Clean,
    Protocol,
}

struct ActiveCompile {
    request_id: u32,
    worker: Worker,
}

/// The inbound variant a callback request left outstanding expects in
/// reply. Recorded alongside the sink so a type-mismatched response (a
/// well-formed frame, a valid outstanding id, but the wrong variant) can be
/// caught as a `PARAMS` protocol error instead of silently handed to the
/// worker, which has no way to tell a mis-routed response from a genuine
/// engine failure (`spec.md` §3, §7).
#[derive(Clone, Copy)]
enum ExpectedResponse {
    Canonicalize,
    Import,
    FileImport,
    FunctionCall,
}

impl ExpectedResponse {
    fn for_request(message: &Outbound) -> Option<Self> {
        match message {
            Outbound::CanonicalizeRequest(_) => Some(Self::Canonicalize),
            Outbound::ImportRequest(_) => Some(Self::Import),
            Outbound::FileImportRequest(_) => Some(Self::FileImport),
            Outbound::FunctionCallRequest(_) => Some(Self::FunctionCall),
            _ => None,
        }
    }

    fn matches(self, message: &Inbound) -> bool {
        matches!(
            (self, message),
            (Self::Canonicalize, Inbound::CanonicalizeResponse(_))
                | (Self::Import, Inbound::ImportResponse(_))
                | (Self::FileImport, Inbound::FileImportResponse(_))
                | (Self::FunctionCall, Inbound::FunctionCallResponse(_))
        )
    }

    fn name(self) -> &'static str {
        match self {
            Self::Canonicalize => "CanonicalizeResponse",
            Self::Import => "ImportResponse",
            Self::FileImport => "FileImportResponse",
            Self::FunctionCall => "FunctionCallResponse",
        }
    }
}

pub async fn run<R, W>(reader: R, mut writer: W, engine: Arc<dyn CompileEngine>) -> ExitOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (outbound_tx, mut outbound_rx) = unbounded_channel::<(u32, OutboundMessage)>();
    let pool = Arc::new(WorkerPool::new(engine, outbound_tx.clone()));
    let (acquired_tx, mut acquired_rx) = unbounded_channel::<(Worker, InboundMessage)>();

    let mut frames = Box::pin(codec::frame_stream(reader));
    let mut outstanding: HashMap<u32, (ExpectedResponse, blocking_mpsc::Sender<InboundMessage>)> =
        HashMap::new();
    let mut active: HashMap<u32, ActiveCompile> = HashMap::new();
    let mut next_outbound_id: u32 = 1;
    let mut stdin_open = true;
    // Counts `CompileRequest`s that have been handed to a spawned acquire
    // task but haven't yet landed in `active`. Without this, a request still
    // queued on a saturated pool when stdin closes would be invisible to the
    // drain check below and the process would exit out from under it.
    let mut pending_compiles: usize = 0;

    loop {
        if !stdin_open && active.is_empty() && pending_compiles == 0 {
            return ExitOutcome::Clean;
        }

        tokio::select! {
            frame = frames.next(), if stdin_open => {
                match frame {
                    None => stdin_open = false,
                    Some(Err(err)) => {
                        return fatal(&mut writer, ProtocolError::new(wire::ERROR_ID, ErrorKind::Parse, err.to_string())).await;
                    }
                    Some(Ok(bytes)) => {
                        let decoded = InboundMessage::decode(bytes.as_slice());
                        let message = match decoded {
                            Ok(message) => message,
                            Err(err) => {
                                return fatal(&mut writer, ProtocolError::new(wire::ERROR_ID, ErrorKind::Parse, err.to_string())).await;
                            }
                        };
                        match dispatch_inbound(message, &pool, &acquired_tx, &mut outstanding, &mut writer).await {
                            Ok(started_compile) => {
                                if started_compile {
                                    pending_compiles += 1;
                                }
                            }
                            Err(err) => return fatal(&mut writer, err).await,
                        }
                    }
                }
            }

            Some((worker, inbound_message)) = acquired_rx.recv() => {
                pending_compiles -= 1;
                let request_id = wire::inbound_id(&inbound_message).expect("CompileRequest carries an id");
                let compilation_id = worker.compilation_id;
                if worker.send(inbound_message).is_ok() {
                    active.insert(compilation_id, ActiveCompile { request_id, worker });
                }
            }

            Some((compilation_id, message)) = outbound_rx.recv() => {
                if let Err(err) = handle_outbound(
                    compilation_id,
                    message,
                    &pool,
                    &mut active,
                    &mut outstanding,
                    &mut next_outbound_id,
                    &mut writer,
                ).await {
                    return fatal(&mut writer, err).await;
                }
            }
        }
    }
}

async fn dispatch_inbound<W: AsyncWrite + Unpin>(
    message: InboundMessage,
    pool: &Arc<WorkerPool>,
    acquired_tx: &tokio::sync::mpsc::UnboundedSender<(Worker, InboundMessage)>,
    outstanding: &mut HashMap<u32, (ExpectedResponse, blocking_mpsc::Sender<InboundMessage>)>,
    writer: &mut W,
) -> Result<bool, ProtocolError> {
    let id = wire::inbound_id(&message)?;

    match message.message.as_ref().expect("inbound_id already validated message is set") {
        Inbound::VersionRequest(_) => {
            let response = version::response(id);
            let outbound = OutboundMessage {
                message: Some(Outbound::VersionResponse(response)),
            };
            write_frame(writer, &outbound)
                .await
                .map_err(|err| ProtocolError::new(wire::ERROR_ID, ErrorKind::Internal, err.to_string()))?;
            Ok(false)
        }

        Inbound::CompileRequest(_) => {
            let pool = pool.clone();
            let acquired_tx = acquired_tx.clone();
            tokio::spawn(async move {
                let worker = pool.acquire().await;
                let _ = acquired_tx.send((worker, message));
            });
            Ok(true)
        }

        response @ (Inbound::CanonicalizeResponse(_)
        | Inbound::ImportResponse(_)
        | Inbound::FileImportResponse(_)
        | Inbound::FunctionCallResponse(_)) => {
            match outstanding.remove(&id) {
                Some((expected, sink)) if expected.matches(response) => {
                    let _ = sink.send(message); // Worker may have exited; best effort.
                    Ok(false)
                }
                Some((expected, _sink)) => Err(ProtocolError::new(
                    id,
                    ErrorKind::Params,
                    format!(
                        "expected a {} for outstanding request {id}, got a different response type",
                        expected.name()
                    ),
                )),
                None => Err(ProtocolError::new(
                    id,
                    ErrorKind::Params,
                    format!("no outstanding request with id {id}"),
                )),
            }
        }
    }
}

async fn handle_outbound<W: AsyncWrite + Unpin>(
    compilation_id: u32,
    message: OutboundMessage,
    pool: &Arc<WorkerPool>,
    active: &mut HashMap<u32, ActiveCompile>,
    outstanding: &mut HashMap<u32, (ExpectedResponse, blocking_mpsc::Sender<InboundMessage>)>,
    next_outbound_id: &mut u32,
    writer: &mut W,
) -> Result<(), ProtocolError> {
    let to_write = match message.message {
        Some(Outbound::CompileResponse(mut response)) => {
            let compile = active.remove(&compilation_id).ok_or_else(|| {
                ProtocolError::new(
                    wire::ERROR_ID,
                    ErrorKind::Internal,
                    format!("CompileResponse from unknown worker {compilation_id}"),
                )
            })?;
            response.id = compile.request_id;
            pool.release(compile.worker);
            OutboundMessage {
                message: Some(Outbound::CompileResponse(response)),
            }
        }
        Some(Outbound::LogEvent(event)) => OutboundMessage {
            message: Some(Outbound::LogEvent(event)),
        },
        Some(Outbound::Error(error)) => OutboundMessage {
            message: Some(Outbound::Error(error)),
        },
        Some(callback) => {
            let id = *next_outbound_id;
            *next_outbound_id += 1;
            let expected = ExpectedResponse::for_request(&callback)
                .expect("every callback variant routed here expects a response");
            let mut outbound = OutboundMessage {
                message: Some(callback),
            };
            wire::set_outbound_id(&mut outbound, id);
            if let Some(compile) = active.get(&compilation_id) {
                outstanding.insert(id, (expected, compile.worker.sink()));
            }
            outbound
        }
        None => return Ok(()),
    };

    write_frame(writer, &to_write)
        .await
        .map_err(|err| ProtocolError::new(wire::ERROR_ID, ErrorKind::Internal, err.to_string()))
}

async fn fatal<W: AsyncWrite + Unpin>(writer: &mut W, error: ProtocolError) -> ExitOutcome {
    eprintln!("{}", error.stderr_line());
    let outbound = OutboundMessage {
        message: Some(Outbound::Error(error.into_wire())),
    };
    let _ = write_frame(writer, &outbound).await;
    let _ = writer.flush().await;
    ExitOutcome::Protocol
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &OutboundMessage,
) -> std::io::Result<()> {
    let payload = message.encode_to_vec();
    let mut framed = Vec::with_capacity(payload.len() + 5);
    codec::encode(&payload, &mut framed);
    writer.write_all(&framed).await?;
    writer.flush().await
}
