//! The four handlers every server ships with: PING, ECHO, HELP and QUIT.
//! Embedders override any of them by registering the same name again.

use crate::command::Command;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::registry::CommandRegistry;

const HELP_TEXT: &str = "respkit server - built-in commands:\n\
    PING [message] - returns PONG or echoes the message\n\
    ECHO message - echoes the message\n\
    QUIT - closes the connection\n\
    (other commands depend on what the embedding server registered)";

pub(crate) fn register_defaults(registry: &CommandRegistry) {
    registry
        .register("PING", ping)
        .expect("literal command name is not empty");
    registry
        .register("ECHO", echo)
        .expect("literal command name is not empty");
    registry
        .register("HELP", help)
        .expect("literal command name is not empty");
    registry
        .register("QUIT", quit)
        .expect("literal command name is not empty");
}

/// PING -> +PONG; PING msg -> bulk echo of msg.
pub fn ping(_conn: &Connection, cmd: &Command) -> Frame {
    match cmd.args.len() {
        0 => Frame::simple("PONG"),
        1 => echo_argument(cmd),
        _ => Frame::error("ERR wrong number of arguments for 'ping' command"),
    }
}

/// ECHO msg -> bulk echo of msg.
pub fn echo(_conn: &Connection, cmd: &Command) -> Frame {
    if cmd.args.len() != 1 {
        return Frame::error("ERR wrong number of arguments for 'echo' command");
    }
    echo_argument(cmd)
}

pub fn help(_conn: &Connection, _cmd: &Command) -> Frame {
    Frame::bulk(HELP_TEXT)
}

/// Fires the close latch and replies `+OK`. The latch only cancels the
/// connection task, so the reply is still written and flushed before the
/// socket is dropped.
pub fn quit(conn: &Connection, _cmd: &Command) -> Frame {
    conn.close();
    Frame::simple("OK")
}

/// Echoes the first argument byte-for-byte, falling back to the textual
/// projection when the client sent it as a simple string.
fn echo_argument(cmd: &Command) -> Frame {
    match cmd.raw.get(1) {
        Some(Frame::Bulk(bytes)) => Frame::Bulk(bytes.clone()),
        _ => Frame::bulk(cmd.args[0].clone()),
    }
}
