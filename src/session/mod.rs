use thiserror::Error;

pub mod mongo;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("auth mechanism '{0}' is not supported by this driver")]
    UnsupportedMechanism(String),
    #[error("{0}")]
    Command(String),
    #[error(transparent)]
    Driver(#[from] mongodb::error::Error),
}

/// One open administrative session to a single database node. The quiesce
/// controller owns the session for the duration of a run and is the only
/// caller of the lock/unlock commands.
pub trait NodeSession {
    fn host(&self) -> &str;

    /// Issue the flush-and-lock command. Returns once the server has accepted
    /// it; the lock is not guaranteed stable until the in-progress operation
    /// list drains (see `in_flight_lock_ops`).
    fn flush_and_lock(&mut self) -> Result<(), SessionError>;

    /// Issue the matching unlock command.
    fn flush_unlock(&mut self) -> Result<(), SessionError>;

    /// Number of in-progress operations still holding the flush lock.
    fn in_flight_lock_ops(&mut self) -> Result<usize, SessionError>;

    /// Release the session and its connection pool. Idempotent; safe to call
    /// on a session that was never fully established.
    fn close(&mut self);
}
