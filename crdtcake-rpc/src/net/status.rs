use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

use rkyv::{Archive, Deserialize, Serialize};

use super::MessageKind;

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Clone)]
#[archive(compare(PartialEq), check_bytes)]
#[archive_attr(derive(PartialEq, Eq, Debug))]
/// Why a session ended without completing.
///
/// Statuses travel between peers inside error frames, the receiving side
/// uses the [ErrorCode] to decide if the connection can still be reused.
pub struct Status {
    pub code: ErrorCode,
    /// A human readable description, forwarded as is to the caller.
    pub message: String,
}

impl Status {
    /// The peer is up but its backing resource cannot serve the session.
    pub fn unavailable(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::Unavailable,
            message: msg.to_string(),
        }
    }

    /// No handler is registered for the message kind.
    pub fn unknown_kind(kind: MessageKind) -> Self {
        Self {
            code: ErrorCode::UnknownKind,
            message: format!("No handler registered for message kind {}", kind),
        }
    }

    /// The handler ran and rejected the session.
    pub fn internal(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::HandlerFailed,
            message: msg.to_string(),
        }
    }

    /// A payload failed validation while archiving or unarchiving it.
    pub fn invalid() -> Self {
        Self {
            code: ErrorCode::MalformedPayload,
            message: "Message payload failed validation".to_string(),
        }
    }

    /// A well formed message arrived out of turn.
    pub fn unexpected(kind: MessageKind) -> Self {
        Self {
            code: ErrorCode::UnexpectedKind,
            message: format!("Message kind {} was not expected in this session", kind),
        }
    }

    pub fn connection(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::Disconnected,
            message: msg.to_string(),
        }
    }

    /// The peer hung up part way through a session.
    pub fn closed() -> Self {
        Self {
            code: ErrorCode::Disconnected,
            message: "Connection closed mid session".to_string(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            code: ErrorCode::TimedOut,
            message: "Session deadline elapsed".to_string(),
        }
    }

    /// Whether the transport failed, as opposed to the peer answering
    /// with a rejection. The connection must be dropped after these.
    pub fn is_connection_error(&self) -> bool {
        matches!(self.code, ErrorCode::Disconnected | ErrorCode::TimedOut)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl Error for Status {}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug, Clone, Copy)]
#[archive(compare(PartialEq), check_bytes)]
#[archive_attr(derive(Debug, PartialEq, Eq))]
pub enum ErrorCode {
    /// The storage behind the handler is unavailable.
    Unavailable,
    /// Nothing on the server handles the message kind.
    UnknownKind,
    /// The handler returned an error of its own.
    HandlerFailed,
    /// Bytes on the wire did not validate as the expected archive.
    MalformedPayload,
    /// A valid message of the wrong kind for the current session step.
    UnexpectedKind,
    /// The socket failed or closed mid session.
    Disconnected,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_survives_archive(status: Status) {
        let bytes = rkyv::to_bytes::<_, 1024>(&status).expect("Serialize OK");
        let archived =
            rkyv::check_archived_root::<'_, Status>(&bytes).expect("Archive OK");
        assert_eq!(archived, &status);
        let copy: Status = rkyv::from_bytes(&bytes).expect("Deserialize OK");
        assert_eq!(copy, status);
    }

    #[test]
    fn test_statuses_cross_the_wire() {
        assert_survives_archive(Status::invalid());
        assert_survives_archive(Status::unexpected(12));
        assert_survives_archive(Status::unknown_kind(99));
        assert_survives_archive(Status::connection("reset by peer"));
        assert_survives_archive(Status::unavailable("partition offline"));
        assert_survives_archive(Status::internal("merge failed"));
    }

    #[test]
    fn test_connection_errors() {
        assert!(Status::closed().is_connection_error());
        assert!(Status::timeout().is_connection_error());
        assert!(!Status::internal("boom").is_connection_error());
        assert!(!Status::unexpected(3).is_connection_error());
        assert!(!Status::unknown_kind(3).is_connection_error());
    }

    #[test]
    fn test_unexpected_and_malformed_are_distinct() {
        assert_eq!(Status::unexpected(4).code, ErrorCode::UnexpectedKind);
        assert_eq!(Status::invalid().code, ErrorCode::MalformedPayload);
        assert!(Status::unknown_kind(42).message.contains("42"));
    }
}
