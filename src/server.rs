use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::command::Command;
use crate::commands;
use crate::config::Config;
use crate::connection::{ClientStream, ConnState, Connection, FrameStream};
use crate::error::ServerError;
use crate::frame::{self, Frame};
use crate::handler::{Handler, Middleware, MiddlewareChain};
use crate::registry::CommandRegistry;

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// A RESP server: accepts clients, reads their command frames, routes them
/// through the middleware chain to a registered handler and writes the reply
/// back, while enforcing deadlines, the admission cap, idle sweeping and
/// ordered shutdown.
///
/// The server carries no storage of its own; handlers close over whatever
/// state the embedder owns.
pub struct Server {
    config: Config,
    registry: CommandRegistry,
    middlewares: MiddlewareChain,
    tls_acceptor: Option<TlsAcceptor>,
    listener: StdMutex<Option<TcpListener>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    connections: RwLock<HashMap<u64, Weak<Connection>>>,
    conn_count: AtomicUsize,
    next_conn_id: AtomicU64,
    in_shutdown: AtomicBool,
    sweeper_started: AtomicBool,
    shutdown_hooks: StdMutex<Vec<ShutdownHook>>,
    cancel: CancellationToken,
    // Every connection task holds a clone of the sender and never sends;
    // shutdown drops the original and waits for `recv` to drain to `None`.
    done_tx: StdMutex<Option<mpsc::Sender<()>>>,
    done_rx: StdMutex<Option<mpsc::Receiver<()>>>,
}

impl Server {
    /// Builds a server from `config` with the four default handlers (PING,
    /// ECHO, HELP, QUIT) registered.
    pub fn new(config: Config) -> Server {
        let tls_acceptor = config.tls.clone().map(TlsAcceptor::from);
        let (done_tx, done_rx) = mpsc::channel(1);

        let server = Server {
            config,
            registry: CommandRegistry::new(),
            middlewares: MiddlewareChain::new(),
            tls_acceptor,
            listener: StdMutex::new(None),
            local_addr: StdMutex::new(None),
            connections: RwLock::new(HashMap::new()),
            conn_count: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            in_shutdown: AtomicBool::new(false),
            sweeper_started: AtomicBool::new(false),
            shutdown_hooks: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            done_tx: StdMutex::new(Some(done_tx)),
            done_rx: StdMutex::new(Some(done_rx)),
        };

        commands::register_defaults(&server.registry);
        server
    }

    /// Registers `handler` for `name` (case-insensitive). Replaces any
    /// previous handler for the same name, including the bundled defaults.
    pub fn register(&self, name: &str, handler: impl Handler + 'static) -> Result<(), ServerError> {
        self.registry.register(name, handler)
    }

    /// Appends a middleware; the first one added is the outermost.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        self.middlewares.add(middleware);
    }

    /// Registers a hook run during shutdown, after every connection has
    /// been signalled closed and before waiting for tasks to finish. Hooks
    /// run in registration order, once.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.shutdown_hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Binds the listener without accepting yet; `serve` picks it up.
    pub async fn listen(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        *self.local_addr.lock().unwrap() = listener.local_addr().ok();
        info!(
            addr = %self.config.addr,
            tls = self.tls_acceptor.is_some(),
            "server listening"
        );
        Ok(listener)
    }

    /// Accept loop. Binds first when `listen` was not called. Returns
    /// cleanly once shutdown is initiated; transient accept errors are
    /// logged and skipped.
    pub async fn serve(self: Arc<Self>) -> Result<(), ServerError> {
        let taken = self.listener.lock().unwrap().take();
        let listener = match taken {
            Some(listener) => listener,
            None => self.bind().await?,
        };

        Arc::clone(&self).start_sweeper();

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => Arc::clone(&self).admit(socket, peer),
                Err(e) => {
                    if self.in_shutdown.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    error!(error = %e, "accept error");
                }
            }
        }
    }

    /// Bind-and-serve in one call.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        self.serve().await
    }

    /// Admission control plus task spawn for one accepted socket.
    fn admit(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        if !self.try_acquire_slot() {
            warn!(
                peer = %peer,
                max = self.config.max_connections,
                "connection limit reached, rejecting connection"
            );
            drop(socket);
            return;
        }

        let done = self.done_tx.lock().unwrap().as_ref().cloned();
        let Some(done) = done else {
            // Shutdown already collected the channel; the accept raced it.
            self.conn_count.fetch_sub(1, Ordering::AcqRel);
            drop(socket);
            return;
        };

        tokio::spawn(async move {
            self.drive_connection(socket, peer).await;
            self.conn_count.fetch_sub(1, Ordering::AcqRel);
            drop(done);
        });
    }

    /// Claims one connection slot. The cap check and the increment are a
    /// single CAS so two racing accepts cannot both squeeze past the limit.
    fn try_acquire_slot(&self) -> bool {
        let max = self.config.max_connections;
        if max == 0 {
            self.conn_count.fetch_add(1, Ordering::AcqRel);
            return true;
        }

        let mut current = self.conn_count.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.conn_count.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[instrument(
        name = "connection",
        skip(self, socket),
        fields(connection_id = tracing::field::Empty, peer = %peer)
    )]
    async fn drive_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let stream = match &self.tls_acceptor {
            Some(acceptor) => {
                let handshake = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    handshake = acceptor.accept(socket) => handshake,
                };
                match handshake {
                    Ok(tls) => ClientStream::Tls(tls),
                    Err(e) => {
                        error!(error = %e, "TLS handshake failed");
                        return;
                    }
                }
            }
            None => ClientStream::Plain(socket),
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("connection_id", id);

        let conn = Arc::new(Connection::new(
            id,
            peer,
            FrameStream::new(stream),
            self.cancel.child_token(),
            self.config.observer.clone(),
        ));

        self.connections
            .write()
            .unwrap()
            .insert(id, Arc::downgrade(&conn));

        self.connection_loop(&conn).await;

        conn.close();
        self.connections.write().unwrap().remove(&id);
        debug!("connection finished");
    }

    /// One command per iteration, strictly in arrival order: the response is
    /// written and flushed before the next frame is read.
    async fn connection_loop(&self, conn: &Arc<Connection>) {
        conn.set_state(ConnState::Active);

        loop {
            let read = {
                let mut transport = conn.io.lock().await;
                tokio::select! {
                    _ = conn.cancel_token().cancelled() => return,
                    read = Self::read_with_deadline(&mut transport, self.config.read_timeout) => read,
                }
            };

            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("peer closed the connection");
                    return;
                }
                Err(e) if e.is_disconnect() => {
                    debug!(error = %e, "connection dropped");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "terminating connection");
                    return;
                }
            };

            conn.touch();

            let cmd = match Command::try_from(frame) {
                Ok(cmd) => cmd,
                Err(e) if e.is_recoverable() => {
                    let reply = Frame::error("ERR empty command");
                    if self.write_response(conn, &reply).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "terminating connection after invalid command frame");
                    return;
                }
            };

            conn.set_state(ConnState::Processing);
            let response = self.dispatch(conn, &cmd);

            if self.write_response(conn, &response).await.is_err() {
                return;
            }
            conn.set_state(ConnState::Active);
        }
    }

    async fn read_with_deadline(
        transport: &mut FrameStream,
        deadline: Option<Duration>,
    ) -> Result<Option<Frame>, frame::Error> {
        match deadline {
            Some(limit) => match time::timeout(limit, transport.read_frame()).await {
                Ok(result) => result,
                Err(_) => Err(frame::Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline expired",
                ))),
            },
            None => transport.read_frame().await,
        }
    }

    async fn write_response(&self, conn: &Connection, frame: &Frame) -> io::Result<()> {
        let mut transport = conn.io.lock().await;

        let result = match self.config.write_timeout {
            Some(limit) => time::timeout(limit, transport.write_frame(frame))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write deadline expired",
                    ))
                }),
            None => transport.write_frame(frame).await,
        };

        if let Err(e) = &result {
            if is_closed_io(e) {
                debug!(error = %e, "response write hit a closed connection");
            } else {
                error!(error = %e, "error writing response");
            }
        }
        result
    }

    /// Routes one command: upper-case lookup, middleware chain, handler.
    /// Unknown names and handler panics become `ERR` replies; neither tears
    /// the connection down.
    ///
    /// The unknown-command reply is the chain's terminal handler, so
    /// middleware still sees commands nobody registered — an auth layer can
    /// gate them all the same.
    pub fn dispatch(&self, conn: &Connection, cmd: &Command) -> Frame {
        if cmd.name.is_empty() {
            return Frame::error("ERR empty command");
        }

        let registered = self.registry.lookup(&cmd.name);
        let unknown = |_: &Connection, cmd: &Command| {
            Frame::error(format!("ERR unknown command '{}'", cmd.name))
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &registered {
            Some(handler) => self.middlewares.execute(conn, cmd, handler.as_ref()),
            None => self.middlewares.execute(conn, cmd, &unknown),
        }));

        match outcome {
            Ok(frame) => frame,
            Err(_) => {
                error!(command = %cmd.name, "handler panicked");
                Frame::error("ERR internal error")
            }
        }
    }

    fn start_sweeper(self: Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.config.idle_timeout.is_zero() || self.config.sweep_interval.is_zero() {
            return;
        }

        tokio::spawn(async move {
            let mut ticker = time::interval(self.config.sweep_interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = ticker.tick() => self.trigger_idle_sweep(),
                }
            }
        });
    }

    /// One sweep pass: connections parked strictly longer than the idle
    /// threshold are marked idle and closed. Exposed so embedders and tests
    /// can force a pass without waiting out the cadence.
    pub fn trigger_idle_sweep(&self) {
        if self.config.idle_timeout.is_zero() {
            return;
        }

        let now = Instant::now();
        for conn in self.snapshot_connections() {
            if !matches!(conn.state(), ConnState::Active | ConnState::Idle) {
                continue;
            }
            let parked = now.duration_since(conn.last_used());
            if parked > self.config.idle_timeout {
                if conn.state() == ConnState::Active {
                    conn.set_state(ConnState::Idle);
                }
                info!(
                    connection_id = conn.id(),
                    peer = %conn.peer_addr(),
                    parked_ms = parked.as_millis() as u64,
                    "closing idle connection"
                );
                conn.close();
            }
        }
    }

    /// Copies live handles out under the read lock so neither the sweeper
    /// nor shutdown ever holds the registry lock across connection work.
    fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Graceful shutdown: stop accepting, close every connection, run the
    /// shutdown hooks, then wait up to `deadline` for connection tasks to
    /// finish. Idempotent; a second call returns immediately and the hooks
    /// run once.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        if self.in_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("shutting down");
        self.cancel.cancel();
        // Release the port when serve never picked the listener up.
        drop(self.listener.lock().unwrap().take());

        for conn in self.snapshot_connections() {
            conn.close();
        }

        let hooks = std::mem::take(&mut *self.shutdown_hooks.lock().unwrap());
        for hook in hooks {
            hook();
        }

        drop(self.done_tx.lock().unwrap().take());
        let receiver = self.done_rx.lock().unwrap().take();
        let Some(mut receiver) = receiver else {
            return Ok(());
        };

        let drained = time::timeout(deadline, async {
            while receiver.recv().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => Err(ServerError::ShutdownTimeout),
        }
    }

    /// Number of currently admitted connections.
    pub fn active_connections(&self) -> usize {
        self.conn_count.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    /// The bound address, once `listen`/`serve` has bound. Useful when the
    /// configured address used port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }
}

fn is_closed_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
