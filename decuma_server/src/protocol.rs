//! Length-framed wire protocol: an 8-byte big-endian length prefix
//! followed by a `bincode`-encoded [`Request`] or [`Response`].

use crate::error::{ServerError, ServerResult};
use decuma_core::{Request, Response};
use std::io::{Read, Write};

/// Frames larger than this are rejected outright — a malformed or hostile
/// length prefix should not cause an unbounded allocation.
const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

pub fn read_request(stream: &mut impl Read, peer: &str) -> ServerResult<Request> {
    let payload = read_frame(stream, peer)?;
    bincode::deserialize(&payload).map_err(|e| ServerError::MalformedFrame {
        peer: peer.to_string(),
        reason: e.to_string(),
    })
}

pub fn write_response(stream: &mut impl Write, response: &Response) -> ServerResult<()> {
    let payload = bincode::serialize(response).map_err(|e| ServerError::MalformedFrame {
        peer: "<local>".to_string(),
        reason: e.to_string(),
    })?;
    write_frame(stream, &payload)
}

fn read_frame(stream: &mut impl Read, peer: &str) -> ServerResult<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    stream
        .read_exact(&mut len_buf)
        .map_err(|_| ServerError::ConnectionClosed { peer: peer.to_string() })?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ServerError::MalformedFrame {
            peer: peer.to_string(),
            reason: format!("frame length {len} exceeds maximum {MAX_FRAME_BYTES}"),
        });
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .map_err(|_| ServerError::ConnectionClosed { peer: peer.to_string() })?;
    Ok(payload)
}

fn write_frame(stream: &mut impl Write, payload: &[u8]) -> ServerResult<()> {
    stream.write_all(&(payload.len() as u64).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips_through_framing() {
        let req = Request::Echo {
            payload: "hello".to_string(),
        };
        let payload = bincode::serialize(&req).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_request(&mut cursor, "test").unwrap();
        match decoded {
            Request::Echo { payload } => assert_eq!(payload, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_request(&mut cursor, "test").is_err());
    }

    #[test]
    fn truncated_stream_reports_connection_closed() {
        let mut cursor = Cursor::new(vec![0u8; 3]);
        assert!(matches!(
            read_request(&mut cursor, "test"),
            Err(ServerError::ConnectionClosed { .. })
        ));
    }
}
