use thiserror::Error as ThisError;

/// Errors surfaced to the embedder through the server API. Codec and
/// command-parsing failures stay local to the connection that produced them
/// and live next to their types (`frame::Error`, `command::CommandError`).
#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error("invalid registration: {0}")]
    Registration(String),
    #[error("shutdown deadline elapsed before all connection tasks finished")]
    ShutdownTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
