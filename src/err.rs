/// Errors surfaced by the transmit engine.
///
/// `MemExhausted` guarantees that the PCB was rolled back to its pre-call
/// state; a future `output()` will still flush a trailing ACK because the
/// engine sets the Nagle-memory-error flag before returning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("connection is in an invalid state for data transmission")]
    InvalidState,

    #[error("invalid argument")]
    InvalidArg,

    #[error("buffer or segment allocator exhausted")]
    MemExhausted,

    #[error("transient backpressure from the ip output hook")]
    WouldBlock,

    #[error("ip output hook failed")]
    IoError,

    #[error("write exceeds the available send buffer")]
    BufferTooSmall,
}

pub type Result<T> = std::result::Result<T, Error>;
