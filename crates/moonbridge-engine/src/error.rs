//! Error types for the Moonbridge engine
//!
//! Every fallible operation returns [`Result`]. Errors raised by the VM are
//! rebuilt host-side from the value left on top of the stack; errors raised by
//! host code travel through the VM as error values and keep their kind when
//! they come back out.

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error taxonomy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Chunk failed to parse or load
    #[error("{0}")]
    Syntax(String),

    /// Error raised while executing VM code, usually followed by a traceback
    #[error("{0}")]
    Runtime(String),

    /// Allocation ceiling hit or the VM ran out of memory
    #[error("{0}")]
    Memory(String),

    /// Deadline exceeded while running
    #[error("{0}")]
    Timeout(String),

    /// Bridge contract violated by the caller
    #[error("{0}")]
    Programming(String),

    /// Error raised by host code
    #[error("{0}")]
    Callback(String),
}

impl Error {
    /// Timeout raised by the run loop and the instruction hook.
    pub fn timeout() -> Self {
        Error::Timeout("thread timeout exceeded".to_string())
    }

    /// Error raised from host code (host functions, rejected futures).
    pub fn callback(message: impl Into<String>) -> Self {
        Error::Callback(message.into())
    }

    /// Contract violation.
    pub fn programming(message: impl Into<String>) -> Self {
        Error::Programming(message.into())
    }

    /// Message without the kind.
    pub fn message(&self) -> &str {
        match self {
            Error::Syntax(m)
            | Error::Runtime(m)
            | Error::Memory(m)
            | Error::Timeout(m)
            | Error::Programming(m)
            | Error::Callback(m) => m,
        }
    }

    /// Short name of the error kind, used by `__tostring`-less consumers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Syntax(_) => "SyntaxError",
            Error::Runtime(_) => "RuntimeError",
            Error::Memory(_) => "MemoryError",
            Error::Timeout(_) => "TimeoutError",
            Error::Programming(_) => "ProgrammingError",
            Error::Callback(_) => "CallbackError",
        }
    }

    pub(crate) fn closed() -> Self {
        Error::Programming("the VM instance has been closed".to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Callback(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Callback(s.to_string())
    }
}
