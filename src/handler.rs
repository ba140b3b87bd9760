use std::sync::{Arc, RwLock};

use crate::command::Command;
use crate::connection::Connection;
use crate::frame::Frame;

/// The capability at the end of the dispatch pipeline: turn a command into
/// a reply frame. Handlers run on the connection task; the framework treats
/// them as opaque and synchronous.
///
/// Any `Fn(&Connection, &Command) -> Frame` is a handler, so closures
/// register directly; implement the trait on a struct when the handler
/// carries state of its own.
pub trait Handler: Send + Sync {
    fn handle(&self, conn: &Connection, cmd: &Command) -> Frame;
}

impl<F> Handler for F
where
    F: Fn(&Connection, &Command) -> Frame + Send + Sync,
{
    fn handle(&self, conn: &Connection, cmd: &Command) -> Frame {
        self(conn, cmd)
    }
}

/// An interceptor wrapped around the handler. Each middleware chooses to
/// delegate to `next`, short-circuit with its own reply, hand `next` a
/// modified copy of the command, or rewrite the reply on the way out.
pub trait Middleware: Send + Sync {
    fn handle(&self, conn: &Connection, cmd: &Command, next: &dyn Handler) -> Frame;
}

impl<F> Middleware for F
where
    F: Fn(&Connection, &Command, &dyn Handler) -> Frame + Send + Sync,
{
    fn handle(&self, conn: &Connection, cmd: &Command, next: &dyn Handler) -> Frame {
        self(conn, cmd, next)
    }
}

/// Append-ordered middleware list: the first middleware added is the
/// outermost call. An empty chain is a direct handler invocation.
///
/// Additions are expected before the server starts accepting but are safe
/// at any point; execution snapshots the list and never holds the lock
/// across middleware code.
#[derive(Default)]
pub struct MiddlewareChain {
    layers: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> MiddlewareChain {
        MiddlewareChain::default()
    }

    pub fn add(&self, middleware: impl Middleware + 'static) {
        self.layers.write().unwrap().push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.layers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `cmd` through every layer down to `terminal`, composing
    /// M₁(M₂(…Mₙ(handler))).
    pub fn execute(&self, conn: &Connection, cmd: &Command, terminal: &dyn Handler) -> Frame {
        let layers = self.layers.read().unwrap().clone();
        Next {
            rest: &layers,
            terminal,
        }
        .handle(conn, cmd)
    }
}

/// The continuation each middleware receives: the remaining layers followed
/// by the terminal handler.
struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Handler,
}

impl Handler for Next<'_> {
    fn handle(&self, conn: &Connection, cmd: &Command) -> Frame {
        match self.rest.split_first() {
            Some((layer, rest)) => layer.handle(
                conn,
                cmd,
                &Next {
                    rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.handle(conn, cmd),
        }
    }
}
