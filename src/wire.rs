//! Message registry: a typed discriminator over the inbound/outbound union,
//! plus the `id` accessor/mutator every variant (save `LogEvent` and
//! `Error`) carries.

use crate::error::{ErrorKind, ProtocolError};
use crate::proto_gen::host::{inbound_message, outbound_message, InboundMessage, OutboundMessage};

/// The sentinel id used on `Error` frames that aren't attributable to a
/// specific request.
pub const ERROR_ID: u32 = 0xFFFF_FFFF;

/// `which` returns a short, human-readable tag for an inbound variant, or
/// a [`ProtocolError`] if the message is unset or unrecognized.
pub fn which_inbound(msg: &InboundMessage) -> Result<&'static str, ProtocolError> {
    match &msg.message {
        None => Err(ProtocolError::new(
            ERROR_ID,
            ErrorKind::Parse,
            "InboundMessage.message is not set.",
        )),
        Some(inbound_message::Message::VersionRequest(_)) => Ok("VersionRequest"),
        Some(inbound_message::Message::CompileRequest(_)) => Ok("CompileRequest"),
        Some(inbound_message::Message::CanonicalizeResponse(_)) => Ok("CanonicalizeResponse"),
        Some(inbound_message::Message::ImportResponse(_)) => Ok("ImportResponse"),
        Some(inbound_message::Message::FileImportResponse(_)) => Ok("FileImportResponse"),
        Some(inbound_message::Message::FunctionCallResponse(_)) => Ok("FunctionCallResponse"),
    }
}

/// `inbound_id` returns the `id` field carried by every inbound variant.
pub fn inbound_id(msg: &InboundMessage) -> Result<u32, ProtocolError> {
    match &msg.message {
        None => Err(ProtocolError::new(
            ERROR_ID,
            ErrorKind::Parse,
            "InboundMessage.message is not set.",
        )),
        Some(inbound_message::Message::VersionRequest(m)) => Ok(m.id),
        Some(inbound_message::Message::CompileRequest(m)) => Ok(m.id),
        Some(inbound_message::Message::CanonicalizeResponse(m)) => Ok(m.id),
        Some(inbound_message::Message::ImportResponse(m)) => Ok(m.id),
        Some(inbound_message::Message::FileImportResponse(m)) => Ok(m.id),
        Some(inbound_message::Message::FunctionCallResponse(m)) => Ok(m.id),
    }
}

/// `outbound_which` tags an outbound variant, mirroring [`which_inbound`].
pub fn which_outbound(msg: &OutboundMessage) -> Result<&'static str, ProtocolError> {
    match &msg.message {
        None => Err(ProtocolError::new(
            ERROR_ID,
            ErrorKind::Internal,
            "OutboundMessage.message is not set.",
        )),
        Some(outbound_message::Message::VersionResponse(_)) => Ok("VersionResponse"),
        Some(outbound_message::Message::CompileResponse(_)) => Ok("CompileResponse"),
        Some(outbound_message::Message::CanonicalizeRequest(_)) => Ok("CanonicalizeRequest"),
        Some(outbound_message::Message::ImportRequest(_)) => Ok("ImportRequest"),
        Some(outbound_message::Message::FileImportRequest(_)) => Ok("FileImportRequest"),
        Some(outbound_message::Message::FunctionCallRequest(_)) => Ok("FunctionCallRequest"),
        Some(outbound_message::Message::LogEvent(_)) => Ok("LogEvent"),
        Some(outbound_message::Message::Error(_)) => Ok("Error"),
    }
}

/// `set_outbound_id` assigns `id` to an outbound variant. `LogEvent` and
/// `Error` carry their own identifiers (a compilation id and the sentinel
/// error id respectively) and are not valid targets.
pub fn set_outbound_id(msg: &mut OutboundMessage, id: u32) {
    match &mut msg.message {
        Some(outbound_message::Message::VersionResponse(m)) => m.id = id,
        Some(outbound_message::Message::CompileResponse(m)) => m.id = id,
        Some(outbound_message::Message::CanonicalizeRequest(m)) => m.id = id,
        Some(outbound_message::Message::ImportRequest(m)) => m.id = id,
        Some(outbound_message::Message::FileImportRequest(m)) => m.id = id,
        Some(outbound_message::Message::FunctionCallRequest(m)) => m.id = id,
        Some(outbound_message::Message::LogEvent(_)) | Some(outbound_message::Message::Error(_)) => {
            panic!("set_outbound_id called on a LogEvent or Error, which carry their own id")
        }
        None => panic!("set_outbound_id called on an unset OutboundMessage"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto_gen::host::VersionRequest;

    #[test]
    fn test_unset_inbound_is_parse_error() {
        let msg = InboundMessage { message: None };
        let err = which_inbound(&msg).unwrap_err();
        assert_eq!(err.message, "InboundMessage.message is not set.");
        assert_eq!(err.id, ERROR_ID);
    }

    #[test]
    fn test_inbound_id_accessor() {
        let msg = InboundMessage {
            message: Some(inbound_message::Message::VersionRequest(VersionRequest {
                id: 7,
            })),
        };
        assert_eq!(inbound_id(&msg).unwrap(), 7);
        assert_eq!(which_inbound(&msg).unwrap(), "VersionRequest");
    }

    #[test]
    fn test_set_outbound_id_round_trips() {
        let mut msg = OutboundMessage {
            message: Some(outbound_message::Message::CompileResponse(
                crate::proto_gen::host::CompileResponse {
                    id: 0,
                    result: None,
                },
            )),
        };
        set_outbound_id(&mut msg, 42);
        match msg.message {
            Some(outbound_message::Message::CompileResponse(m)) => assert_eq!(m.id, 42),
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    #[should_panic]
    fn test_set_outbound_id_panics_on_log_event() {
        let mut msg = OutboundMessage {
            message: Some(outbound_message::Message::LogEvent(
                crate::proto_gen::host::LogEvent {
                    compilation_id: 1,
                    r#type: 0,
                    message: String::new(),
                    formatted: String::new(),
                    span: None,
                    stack_trace: String::new(),
                },
            )),
        };
        set_outbound_id(&mut msg, 1);
    }
}
