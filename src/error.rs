use thiserror::Error;

/// Errors the WAL subsystem can raise.
///
/// `DuplicateBegin` and `UnknownTid` are programmer errors: the caller (a
/// transaction manager) violated a precondition. `CorruptLog` covers every
/// malformed-record condition recovery and rollback can encounter. `Lock`
/// covers failure to acquire the process-level exclusive lock on the log
/// file. `Io` wraps the underlying filesystem.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("begin on already-live transaction {0}")]
    DuplicateBegin(u64),

    #[error("unknown transaction id {0}")]
    UnknownTid(u64),

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WalError>;
