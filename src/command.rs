use thiserror::Error as ThisError;

use crate::frame::Frame;

/// A client request decoded from its RESP array frame.
///
/// `name` keeps the casing the client sent; routing upper-cases it at lookup
/// time. `args` is the textual projection of every frame after the first —
/// handlers that care about binary-exact argument bytes read them back out
/// of `raw`, which retains the original frames including the name.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
    pub raw: Vec<Frame>,
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandError {
    #[error("protocol error; expected array, got {0}")]
    NotArray(Frame),
    /// A zero-element array is a well-formed frame but not a command; the
    /// connection answers `ERR empty command` and stays open.
    #[error("empty command array")]
    Empty,
    #[error("protocol error; command name must be a simple or bulk string")]
    InvalidName,
    #[error("protocol error; argument at index {0} must be a simple or bulk string")]
    InvalidArgument(usize),
}

impl CommandError {
    /// Whether the failure is answerable in-band. Anything else violates the
    /// framing contract and tears the connection down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CommandError::Empty)
    }
}

impl TryFrom<Frame> for Command {
    type Error = CommandError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the server as RESP arrays.
        let frames = match frame {
            Frame::Array(frames) => frames,
            frame => return Err(CommandError::NotArray(frame)),
        };

        if frames.is_empty() {
            return Err(CommandError::Empty);
        }

        let name = match &frames[0] {
            Frame::Simple(s) => s.clone(),
            Frame::Bulk(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            _ => return Err(CommandError::InvalidName),
        };

        let mut args = Vec::with_capacity(frames.len() - 1);
        for (index, frame) in frames.iter().enumerate().skip(1) {
            match frame {
                Frame::Simple(s) => args.push(s.clone()),
                Frame::Bulk(bytes) => args.push(String::from_utf8_lossy(bytes).into_owned()),
                _ => return Err(CommandError::InvalidArgument(index)),
            }
        }

        Ok(Command {
            name,
            args,
            raw: frames,
        })
    }
}
