//! Wire protocol between the buffer broker and its clients.
//!
//! Every exchange is one length-prefixed frame: a little-endian `u32` body
//! length followed by the body. The first body byte is the opcode; the rest
//! is a hand-rolled little-endian encoding of the operands. The first frame
//! on every connection must be [`Request::Auth`].

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{BufferCategory, BufferName};
use crate::envelope::Envelope;
use crate::error::{AppResult, HubError};

/// Upper bound on one frame body. Generous for sensor payloads, small enough
/// that a garbage length prefix cannot exhaust memory.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RequestOp {
    Auth = 0,
    Push = 1,
    Pop = 2,
    Len = 3,
    Ping = 4,
}

impl RequestOp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestOp::Auth),
            1 => Some(RequestOp::Push),
            2 => Some(RequestOp::Pop),
            3 => Some(RequestOp::Len),
            4 => Some(RequestOp::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ResponseOp {
    Ok = 0,
    Item = 1,
    Len = 2,
    Pong = 3,
    Denied = 4,
    Error = 5,
}

impl ResponseOp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseOp::Ok),
            1 => Some(ResponseOp::Item),
            2 => Some(ResponseOp::Len),
            3 => Some(ResponseOp::Pong),
            4 => Some(ResponseOp::Denied),
            5 => Some(ResponseOp::Error),
            _ => None,
        }
    }
}

/// A client-to-broker request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Present the shared credential. Must be the first frame sent.
    Auth { credential: String },
    /// Append an envelope to the named buffer.
    Push { name: BufferName, envelope: Envelope },
    /// Remove and return the head of the named buffer; the broker answers
    /// only once an item is available.
    Pop { name: BufferName },
    /// Current depth of the named buffer.
    Len { name: BufferName },
    /// Liveness probe; the broker answers `Pong`.
    Ping,
}

/// A broker-to-client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Item(Envelope),
    Len(u64),
    Pong,
    /// Credential rejected; the broker closes the connection after this.
    Denied,
    Error(String),
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Auth { credential } => {
                buf.push(RequestOp::Auth as u8);
                put_bytes(&mut buf, credential.as_bytes());
            }
            Request::Push { name, envelope } => {
                buf.push(RequestOp::Push as u8);
                buf.push(name.wire_id());
                encode_envelope(&mut buf, envelope);
            }
            Request::Pop { name } => {
                buf.push(RequestOp::Pop as u8);
                buf.push(name.wire_id());
            }
            Request::Len { name } => {
                buf.push(RequestOp::Len as u8);
                buf.push(name.wire_id());
            }
            Request::Ping => buf.push(RequestOp::Ping as u8),
        }
        buf
    }

    pub fn decode(data: &[u8]) -> AppResult<Self> {
        let mut cursor = Cursor::new(data);
        let op = RequestOp::from_u8(cursor.take_u8()?)
            .ok_or_else(|| HubError::Protocol("invalid request opcode".into()))?;
        let request = match op {
            RequestOp::Auth => Request::Auth {
                credential: cursor.take_string()?,
            },
            RequestOp::Push => {
                let name = cursor.take_buffer_name()?;
                let envelope = decode_envelope(&mut cursor)?;
                Request::Push { name, envelope }
            }
            RequestOp::Pop => Request::Pop {
                name: cursor.take_buffer_name()?,
            },
            RequestOp::Len => Request::Len {
                name: cursor.take_buffer_name()?,
            },
            RequestOp::Ping => Request::Ping,
        };
        cursor.finish()?;
        Ok(request)
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Ok => buf.push(ResponseOp::Ok as u8),
            Response::Item(envelope) => {
                buf.push(ResponseOp::Item as u8);
                encode_envelope(&mut buf, envelope);
            }
            Response::Len(n) => {
                buf.push(ResponseOp::Len as u8);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Response::Pong => buf.push(ResponseOp::Pong as u8),
            Response::Denied => buf.push(ResponseOp::Denied as u8),
            Response::Error(message) => {
                buf.push(ResponseOp::Error as u8);
                put_bytes(&mut buf, message.as_bytes());
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> AppResult<Self> {
        let mut cursor = Cursor::new(data);
        let op = ResponseOp::from_u8(cursor.take_u8()?)
            .ok_or_else(|| HubError::Protocol("invalid response opcode".into()))?;
        let response = match op {
            ResponseOp::Ok => Response::Ok,
            ResponseOp::Item => Response::Item(decode_envelope(&mut cursor)?),
            ResponseOp::Len => Response::Len(cursor.take_u64()?),
            ResponseOp::Pong => Response::Pong,
            ResponseOp::Denied => Response::Denied,
            ResponseOp::Error => Response::Error(cursor.take_string()?),
        };
        cursor.finish()?;
        Ok(response)
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame body.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> AppResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(HubError::Protocol(format!("frame too large: {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn encode_envelope(buf: &mut Vec<u8>, envelope: &Envelope) {
    buf.push(match envelope.category {
        BufferCategory::Pubsub => 0,
        BufferCategory::Raw => 1,
    });
    put_bytes(buf, envelope.origin.as_bytes());
    put_bytes(buf, &envelope.payload);
    buf.extend_from_slice(&envelope.received_at.timestamp_millis().to_le_bytes());
}

fn decode_envelope(cursor: &mut Cursor<'_>) -> AppResult<Envelope> {
    let category = match cursor.take_u8()? {
        0 => BufferCategory::Pubsub,
        1 => BufferCategory::Raw,
        other => {
            return Err(HubError::Protocol(format!(
                "invalid envelope category: {other}"
            )))
        }
    };
    let origin = cursor.take_string()?;
    let payload = cursor.take_bytes()?.to_vec();
    let millis = cursor.take_i64()?;
    let received_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| HubError::Protocol(format!("invalid timestamp: {millis}")))?;
    Ok(Envelope {
        category,
        origin,
        payload,
        received_at,
    })
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Bounds-checked reader over one frame body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> AppResult<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(HubError::Protocol("truncated frame".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> AppResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> AppResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u64(&mut self) -> AppResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| HubError::Protocol("truncated frame".into()))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn take_i64(&mut self) -> AppResult<i64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| HubError::Protocol("truncated frame".into()))?;
        Ok(i64::from_le_bytes(bytes))
    }

    fn take_bytes(&mut self) -> AppResult<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    fn take_string(&mut self) -> AppResult<String> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| HubError::Protocol(format!("invalid UTF-8: {e}")))
    }

    fn take_buffer_name(&mut self) -> AppResult<BufferName> {
        let id = self.take_u8()?;
        BufferName::from_wire(id).ok_or(HubError::UnknownBuffer(id))
    }

    fn finish(&self) -> AppResult<()> {
        if self.pos != self.data.len() {
            return Err(HubError::Protocol("trailing bytes in frame".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope::new(BufferCategory::Raw, "127.0.0.1:9999", b"heartbeat".to_vec())
    }

    #[test]
    fn test_auth_roundtrip() {
        let req = Request::Auth {
            credential: "secret".to_string(),
        };
        let decoded = Request::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_push_roundtrip() {
        let original = sample_envelope();
        let req = Request::Push {
            name: BufferName::RawRx,
            envelope: original.clone(),
        };
        let decoded = Request::decode(&req.encode()).unwrap();
        match decoded {
            Request::Push { name, envelope } => {
                assert_eq!(name, BufferName::RawRx);
                assert_eq!(envelope.origin, "127.0.0.1:9999");
                assert_eq!(envelope.payload, b"heartbeat");
                // Millisecond precision survives the wire.
                assert_eq!(
                    envelope.received_at.timestamp_millis(),
                    original.received_at.timestamp_millis()
                );
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_item_response_roundtrip() {
        let resp = Response::Item(sample_envelope());
        let decoded = Response::decode(&resp.encode()).unwrap();
        match decoded {
            Response::Item(envelope) => assert_eq!(envelope.payload, b"heartbeat"),
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_len_and_control_responses() {
        for resp in [
            Response::Ok,
            Response::Len(42),
            Response::Pong,
            Response::Denied,
            Response::Error("unknown method".to_string()),
        ] {
            assert_eq!(Response::decode(&resp.encode()).unwrap(), resp);
        }
    }

    #[test]
    fn test_unknown_buffer_id_rejected() {
        // Pop request naming buffer id 9, which is not registered.
        let body = vec![2u8, 9u8];
        match Request::decode(&body) {
            Err(crate::error::HubError::UnknownBuffer(9)) => {}
            other => panic!("expected UnknownBuffer, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_opcode_rejected() {
        assert!(Request::decode(&[200u8]).is_err());
        assert!(Response::decode(&[200u8]).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let req = Request::Auth {
            credential: "secret".to_string(),
        };
        let encoded = req.encode();
        assert!(Request::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn test_frame_io_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let body = Request::Ping.encode();
        write_frame(&mut client, &body).await.unwrap();
        let read = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(read, body);

        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }
}
