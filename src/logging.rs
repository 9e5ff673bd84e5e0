//! Structured logging for the process's own diagnostics, plus the
//! per-compilation diagnostics formatter described in `spec.md` §4.C step 2.
//!
//! The stderr layer is modeled on the corpus's `ops::tracing::Layer`: a
//! `tracing_subscriber::Layer` that turns events (and their enclosing spans)
//! into newline-delimited JSON on stderr. It is independent of
//! [`CompilationLogger`], which renders `LogEvent`s destined for the host
//! over the wire protocol, not for the operator's terminal.

use crate::proto_gen::host::{LogEvent, LogEventType, OutboundMessage, SourceSpan};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Serialize, Clone, Debug)]
struct Log {
    #[serde(serialize_with = "time::serde::rfc3339::serialize")]
    ts: time::OffsetDateTime,
    level: String,
    message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    fields: serde_json::Map<String, serde_json::Value>,
}

/// Writes canonical JSON log lines to stderr. This is the process's own
/// operational log, separate from the per-compilation `LogEvent` channel.
pub fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber,
{
    Layer
}

struct Layer;

impl<S> tracing_subscriber::Layer<S> for Layer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut fields = serde_json::Map::new();
        let mut message = String::new();
        event.record(&mut FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        });
        fields.insert("module".to_string(), json!(event.metadata().target()));

        let log = Log {
            ts: time::OffsetDateTime::now_utc(),
            level: event.metadata().level().as_str().to_lowercase(),
            message,
            fields,
        };

        let mut buf = serde_json::to_vec(&log).expect("Log always serializes");
        buf.push(b'\n');
        let _ = std::io::stderr().write_all(&buf); // Best-effort.
    }
}

struct FieldVisitor<'a> {
    fields: &'a mut serde_json::Map<String, serde_json::Value>,
    message: &'a mut String,
}

impl<'a> tracing::field::Visit for FieldVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), json!(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), json!(value));
        }
    }
}

/// Formats and emits `LogEvent`s for one active compilation, matching the
/// alert-color / alert-ascii flags carried on the originating `CompileRequest`
/// and de-duplicating repeated deprecation warnings within the compilation.
pub struct CompilationLogger {
    compilation_id: u32,
    alert_color: bool,
    alert_ascii: bool,
    outbound_tx: UnboundedSender<(u32, OutboundMessage)>,
    seen_deprecations: Mutex<HashSet<String>>,
}

impl CompilationLogger {
    pub fn new(
        compilation_id: u32,
        alert_color: bool,
        alert_ascii: bool,
        outbound_tx: UnboundedSender<(u32, OutboundMessage)>,
    ) -> Self {
        Self {
            compilation_id,
            alert_color,
            alert_ascii,
            outbound_tx,
            seen_deprecations: Mutex::new(HashSet::new()),
        }
    }

    pub fn warning(&self, message: &str, span: Option<SourceSpan>) {
        self.emit(LogEventType::Warning, message, span);
    }

    pub fn deprecation_warning(&self, message: &str, span: Option<SourceSpan>) {
        {
            let mut seen = self.seen_deprecations.lock().expect("not poisoned");
            if !seen.insert(message.to_string()) {
                return; // Already warned about this exact message.
            }
        }
        self.emit(LogEventType::DeprecationWarning, message, span);
    }

    pub fn debug(&self, message: &str, span: Option<SourceSpan>) {
        self.emit(LogEventType::Debug, message, span);
    }

    fn emit(&self, kind: LogEventType, message: &str, span: Option<SourceSpan>) {
        let formatted = self.format(kind, message, span.as_ref());
        let event = LogEvent {
            compilation_id: self.compilation_id,
            r#type: kind as i32,
            message: message.to_string(),
            formatted,
            span,
            stack_trace: String::new(),
        };
        let _ = self
            .outbound_tx
            .send((self.compilation_id, OutboundMessage {
                message: Some(
                    crate::proto_gen::host::outbound_message::Message::LogEvent(event),
                ),
            }));
    }

    fn format(&self, kind: LogEventType, message: &str, span: Option<&SourceSpan>) -> String {
        let label = match kind {
            LogEventType::Warning => "Warning",
            LogEventType::DeprecationWarning => "Deprecation Warning",
            LogEventType::Debug => "Debug",
            LogEventType::Log => "Log",
        };
        let rule = if self.alert_ascii { "-" } else { "─" }.repeat(label.len() + 2);

        let label = if self.alert_color {
            let color = match kind {
                LogEventType::Warning | LogEventType::DeprecationWarning => "\x1b[33m",
                LogEventType::Debug => "\x1b[36m",
                LogEventType::Log => "",
            };
            format!("{color}{label}\x1b[0m")
        } else {
            label.to_string()
        };

        let mut out = format!("{rule}\n{label}: {message}\n");
        if let Some(span) = span {
            out.push_str(&format!("  {}:{}\n", span.url, span.start_line));
        }
        out.push_str(&rule);
        out
    }
}
