// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;
use std::num::IntErrorKind;
use std::str;

use bytes::{Buf, Bytes};
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Largest bulk string body the parser will allocate for: 512 MiB.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest number of elements a single array frame may declare.
pub const MAX_ARRAY_LEN: usize = 1_048_576;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Not enough buffered data to parse an entire frame. Internal to the
    /// streaming read loop; never surfaces to a connection.
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("stream closed in the middle of a frame")]
    UnexpectedEof,
    #[error("invalid frame type byte: {0:#04x}")]
    InvalidTypeByte(u8),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("integer does not fit a signed 64-bit value")]
    IntegerOverflow,
    #[error("{what} length {len} exceeds the maximum of {max}")]
    Oversize {
        what: &'static str,
        len: i64,
        max: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// A peer vanishing mid-frame or an already-torn-down socket is routine
    /// and only worth debug noise; everything else is logged loudly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::UnexpectedEof => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A single RESP frame. The variant alone decides how the payload is
/// interpreted and serialised; `Null` is the `$-1\r\n` sentinel, distinct
/// from an empty `Bulk`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Array(Vec<Frame>),
    Null,
}

impl Frame {
    pub fn simple(text: impl Into<String>) -> Frame {
        Frame::Simple(text.into())
    }

    pub fn error(message: impl Into<String>) -> Frame {
        Frame::Error(message.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }

    /// Parses one frame out of `src`, leaving the cursor just past it.
    ///
    /// Returns `Error::Incomplete` when the buffer does not yet hold a full
    /// frame; the caller is expected to read more bytes and retry from the
    /// original position. All other errors are terminal for the stream.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_byte(src)? {
            b'+' => {
                let line = get_line(src)?;
                let text = str::from_utf8(line)
                    .map_err(|_| Error::Malformed("simple string is not valid UTF-8".into()))?;
                Ok(Frame::Simple(text.to_string()))
            }
            b'-' => {
                let line = get_line(src)?;
                let text = str::from_utf8(line)
                    .map_err(|_| Error::Malformed("error reply is not valid UTF-8".into()))?;
                Ok(Frame::Error(text.to_string()))
            }
            b':' => {
                let line = get_line(src)?;
                Ok(Frame::Integer(parse_decimal(line)?))
            }
            b'$' => {
                let line = get_line(src)?;
                let len = parse_decimal(line)?;

                if len == -1 {
                    return Ok(Frame::Null);
                }
                if len < -1 {
                    return Err(Error::Malformed(format!("invalid bulk length {}", len)));
                }
                if len as u64 > MAX_BULK_LEN as u64 {
                    return Err(Error::Oversize {
                        what: "bulk string",
                        len,
                        max: MAX_BULK_LEN,
                    });
                }

                let len = len as usize;
                // Body plus its trailing CRLF.
                if src.remaining() < len + 2 {
                    return Err(Error::Incomplete);
                }

                let start = src.position() as usize;
                let data = Bytes::copy_from_slice(&src.get_ref()[start..start + len]);
                src.advance(len + 2);

                Ok(Frame::Bulk(data))
            }
            b'*' => {
                let line = get_line(src)?;
                let len = parse_decimal(line)?;

                if len == -1 {
                    return Ok(Frame::Null);
                }
                if len < -1 {
                    return Err(Error::Malformed(format!("invalid array length {}", len)));
                }
                if len as u64 > MAX_ARRAY_LEN as u64 {
                    return Err(Error::Oversize {
                        what: "array",
                        len,
                        max: MAX_ARRAY_LEN,
                    });
                }

                let len = len as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(items))
            }
            byte => Err(Error::InvalidTypeByte(byte)),
        }
    }

    /// Serialises the frame to its exact wire representation. The caller
    /// owns writing and flushing the returned bytes.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'+');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'-');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let repr = i.to_string();
                let mut bytes = Vec::with_capacity(1 + repr.len() + CRLF.len());
                bytes.push(b':');
                bytes.extend_from_slice(repr.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(data) => {
                let header = data.len().to_string();
                let mut bytes =
                    Vec::with_capacity(1 + header.len() + CRLF.len() + data.len() + CRLF.len());
                bytes.push(b'$');
                bytes.extend_from_slice(header.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Array(items) => {
                let header = items.len().to_string();
                let mut bytes = Vec::with_capacity(1 + header.len() + CRLF.len());
                bytes.push(b'*');
                bytes.extend_from_slice(header.as_bytes());
                bytes.extend_from_slice(CRLF);
                for item in items {
                    bytes.extend(item.serialize());
                }
                bytes
            }
            // The canonical RESP2 null reply is the null bulk string.
            Frame::Null => b"$-1\r\n".to_vec(),
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(items) => {
                write!(f, "*{}", items.len())?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                Ok(())
            }
        }
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// Reads up to the next line terminator, tolerating both CRLF and bare LF,
/// and returns the line without its terminator.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    let newline = buf[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| start + i)
        .ok_or(Error::Incomplete)?;

    src.set_position((newline + 1) as u64);

    let mut line = &buf[start..newline];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Ok(line)
}

/// Parses a signed decimal integer or length prefix, distinguishing
/// out-of-range values from garbage.
fn parse_decimal(line: &[u8]) -> Result<i64, Error> {
    let text =
        str::from_utf8(line).map_err(|_| Error::Malformed("decimal is not valid UTF-8".into()))?;

    text.parse::<i64>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => Error::IntegerOverflow,
        _ => Error::Malformed(format!("invalid decimal {:?}", text)),
    })
}
