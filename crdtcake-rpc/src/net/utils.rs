use std::mem;

use super::MessageKind;
use crate::{Status, SCRATCH_SPACE};

static HEADER_TERMINATOR: &[u8] = b"\r\n";

pub const FRAME_TYPE_SIZE: usize = 1;
pub const MESSAGE_KIND_SIZE: usize = mem::size_of::<MessageKind>();
pub const DATA_LEN_SIZE: usize = mem::size_of::<u32>();
pub const LEN_SIZE: usize = FRAME_TYPE_SIZE + MESSAGE_KIND_SIZE + DATA_LEN_SIZE;
pub const HEADER_SIZE: usize = LEN_SIZE + 2;
pub const FRAME_TYPE_PAYLOAD: u8 = 0;
pub const FRAME_TYPE_ERROR: u8 = 1;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameHeader {
    Payload { kind: MessageKind, data: usize },
    Error { data: usize },
}

/// Parses a frame header from the head of the buffer.
///
/// Returns `None` if the buffer does not start with a valid header.
pub(crate) fn parse_header(buf: &[u8]) -> Option<FrameHeader> {
    let header = buf.get(..HEADER_SIZE)?;

    if &header[LEN_SIZE..] != HEADER_TERMINATOR {
        return None;
    }

    let kind_bytes = &header[FRAME_TYPE_SIZE..FRAME_TYPE_SIZE + MESSAGE_KIND_SIZE];
    let data_size_bytes = &header[FRAME_TYPE_SIZE + MESSAGE_KIND_SIZE..LEN_SIZE];
    let data_size = u32::from_le_bytes(data_size_bytes.try_into().ok()?) as usize;

    let header = match header[0] {
        FRAME_TYPE_PAYLOAD => FrameHeader::Payload {
            kind: MessageKind::from_le_bytes(kind_bytes.try_into().ok()?),
            data: data_size,
        },
        FRAME_TYPE_ERROR => FrameHeader::Error { data: data_size },
        _ => return None,
    };

    Some(header)
}

fn serialize_header(
    frame_type: u8,
    kind: MessageKind,
    data_size: usize,
) -> [u8; HEADER_SIZE] {
    let mut header = [0; HEADER_SIZE];
    header[0] = frame_type;
    header[FRAME_TYPE_SIZE..FRAME_TYPE_SIZE + MESSAGE_KIND_SIZE]
        .copy_from_slice(&kind.to_le_bytes());
    header[FRAME_TYPE_SIZE + MESSAGE_KIND_SIZE..LEN_SIZE]
        .copy_from_slice(&(data_size as u32).to_le_bytes());
    header[LEN_SIZE..].copy_from_slice(HEADER_TERMINATOR);
    header
}

/// Serializes a message payload into a frame.
pub(crate) fn serialize_message(kind: MessageKind, msg_bytes: &[u8]) -> Vec<u8> {
    let header = serialize_header(FRAME_TYPE_PAYLOAD, kind, msg_bytes.len());

    let mut buffer = Vec::with_capacity(HEADER_SIZE + msg_bytes.len());
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(msg_bytes);
    buffer
}

/// Serializes a error payload into a frame, if the error serialization fails
/// an empty error frame is produced.
pub(crate) fn serialize_error(status: &Status) -> Vec<u8> {
    let status_bytes = match rkyv::to_bytes::<_, SCRATCH_SPACE>(status) {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(error = ?error, "Failed to serialize error payload, returning default...");
            return serialize_header(FRAME_TYPE_ERROR, 0, 0).to_vec();
        },
    };

    let header = serialize_header(FRAME_TYPE_ERROR, 0, status_bytes.len());

    let mut buffer = Vec::with_capacity(HEADER_SIZE + status_bytes.len());
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&status_bytes);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_header() {
        let frame = serialize_message(7, b"hello");
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(
            parse_header(&frame),
            Some(FrameHeader::Payload { kind: 7, data: 5 }),
        );
    }

    #[test]
    fn test_error_header() {
        let frame = serialize_error(&Status::timeout());
        match parse_header(&frame) {
            Some(FrameHeader::Error { data }) => assert_eq!(data, frame.len() - HEADER_SIZE),
            other => panic!("Expected error header, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_header() {
        let mut frame = serialize_message(1, b"x");
        frame[LEN_SIZE] = b'X';
        assert_eq!(parse_header(&frame), None, "Missing terminator should be rejected.");

        let mut frame = serialize_message(1, b"x");
        frame[0] = 9;
        assert_eq!(parse_header(&frame), None, "Unknown frame types should be rejected.");

        assert_eq!(parse_header(b"\x00\x01"), None, "Short buffers have no header.");
    }
}
