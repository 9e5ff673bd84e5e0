//! The three-kind wire error taxonomy and the dispatcher-internal error
//! type that carries it.

use crate::proto_gen::host::{self, ErrorType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Params,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Params => "params",
            ErrorKind::Internal => "internal",
        }
    }
}

impl From<ErrorKind> for ErrorType {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Parse => ErrorType::Parse,
            ErrorKind::Params => ErrorType::Params,
            ErrorKind::Internal => ErrorType::Internal,
        }
    }
}

/// A fatal protocol error: malformed framing, an unknown/unset message
/// variant, or a semantically invalid response. Raising one of these
/// tears the process down per `spec.md` §7.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?} error{}: {message}", id_suffix(*id))]
pub struct ProtocolError {
    pub id: u32,
    pub kind: ErrorKind,
    pub message: String,
    pub stack_trace: String,
}

fn id_suffix(id: u32) -> String {
    if id == crate::wire::ERROR_ID {
        String::new()
    } else {
        format!(" with request {id}")
    }
}

impl ProtocolError {
    pub fn new(id: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// Render as the stderr diagnostic line specified in `spec.md` §4.D / §7.
    /// `INTERNAL`-kind errors get the distinct "Internal compiler error"
    /// wording `spec.md` §7 reserves for uncaught engine exceptions; the
    /// other two kinds use the "Host caused ... error" wording.
    pub fn stderr_line(&self) -> String {
        match self.kind {
            ErrorKind::Internal => {
                format!("Internal compiler error: {}\n{}", self.message, self.stack_trace)
            }
            _ => format!(
                "Host caused {} error{}: {}",
                self.kind.as_str(),
                id_suffix(self.id),
                self.message
            ),
        }
    }

    pub fn into_wire(self) -> host::ProtocolError {
        host::ProtocolError {
            id: self.id,
            r#type: ErrorType::from(self.kind) as i32,
            message: self.message,
        }
    }
}
