use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::StateObserver;
use crate::frame::{self, Frame};

/// Lifecycle of a client connection.
///
/// `New` on accept, `Active` while parked between commands, `Processing`
/// across handler dispatch, `Idle` once the sweeper notices a quiet
/// connection, `Closed` exactly once however termination is reached.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    New = 0,
    Active = 1,
    Processing = 2,
    Idle = 3,
    Closed = 4,
}

impl From<u8> for ConnState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Processing,
            3 => ConnState::Idle,
            _ => ConnState::Closed,
        }
    }
}

/// The accepted socket, plain or wrapped by the TLS acceptor.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl ClientStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ClientStream::Plain(s) => s.peer_addr(),
            ClientStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl From<TcpStream> for ClientStream {
    fn from(stream: TcpStream) -> Self {
        ClientStream::Plain(stream)
    }
}

/// Frame-level I/O over one client socket: a buffered writer for responses
/// and an accumulation buffer the streaming parser works against.
pub struct FrameStream {
    stream: BufWriter<ClientStream>,
    // Data is read from the socket into the read buffer. When a frame is
    // parsed, the corresponding bytes are removed from the buffer.
    buffer: BytesMut,
}

impl FrameStream {
    pub fn new(stream: impl Into<ClientStream>) -> FrameStream {
        FrameStream {
            stream: BufWriter::new(stream.into()),
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Reads exactly one frame. `Ok(None)` means the peer closed cleanly on
    /// a frame boundary; EOF mid-frame is `Error::UnexpectedEof`.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, frame::Error> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(frame::Error::UnexpectedEof)
                };
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, frame::Error> {
        let mut cursor = Cursor::new(&self.buffer[..]);

        match Frame::parse(&mut cursor) {
            Ok(frame) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Err(frame::Error::Incomplete) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Serialises one frame into the buffered writer and flushes it, so the
    /// response is fully on the wire before the next read begins.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let bytes = frame.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }
}

/// One client connection: the framed socket plus the state shared with the
/// server's registry, the idle sweeper and shutdown.
///
/// The transport is locked only by the task driving the connection; every
/// other party interacts through the state machine, the `last_used` stamp
/// and the close latch, so closing never contends with socket I/O.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    pub(crate) io: AsyncMutex<FrameStream>,
    state: AtomicU8,
    last_used: StdMutex<Instant>,
    closed: AtomicBool,
    // Serialises state stores with the latch so an observer can never see a
    // transition after Closed was reported.
    transition: StdMutex<()>,
    cancel: CancellationToken,
    observer: Option<StateObserver>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        io: FrameStream,
        cancel: CancellationToken,
        observer: Option<StateObserver>,
    ) -> Connection {
        let conn = Connection {
            id,
            peer_addr,
            io: AsyncMutex::new(io),
            state: AtomicU8::new(ConnState::New as u8),
            last_used: StdMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            transition: StdMutex::new(()),
            cancel,
            observer,
        };
        conn.notify(ConnState::New);
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    /// Stamps activity and revives a connection the sweeper had parked in
    /// `Idle`.
    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
        if self.state() == ConnState::Idle {
            self.set_state(ConnState::Active);
        }
    }

    pub(crate) fn set_state(&self, next: ConnState) {
        let _guard = self.transition.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.state.swap(next as u8, Ordering::AcqRel) != next as u8 {
            self.notify(next);
        }
    }

    /// The one-shot close latch. The first caller moves the connection to
    /// `Closed`, reports the transition, and cancels the connection task;
    /// the task drops the socket on its way out. Every termination path
    /// (EOF, I/O or codec error, sweeper, shutdown, QUIT) ends up here.
    pub fn close(&self) {
        {
            let _guard = self.transition.lock().unwrap();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.state.store(ConnState::Closed as u8, Ordering::Release);
            self.notify(ConnState::Closed);
        }
        self.cancel.cancel();
    }

    fn notify(&self, state: ConnState) {
        if let Some(observer) = &self.observer {
            observer(self.peer_addr, state);
        }
    }
}
