use std::io;
use thiserror::Error;

/// The error type returned by methods in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS call (ptrace, waitpid, open, ...) failed.
    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: io::Error,
    },
    /// An operation was attempted in a state that does not permit it.
    #[error("invalid call: {0}")]
    InvalidCall(String),
    /// A symbol, line entry or stack level could not be found.
    #[error("not found: {0}")]
    NotFound(String),
    /// The remote Lua view is structurally inconsistent.
    #[error("bad remote state: {0}")]
    BadState(String),
    /// An argument violated the callee's contract.
    #[error("bad argument: {0}")]
    BadArgument(String),
    /// Malformed user input.
    #[error("bad format: {0}")]
    BadFormat(String),
    /// The requested operation cannot be performed on this target.
    #[error("operation not supported: {0}")]
    NotSupported(String),
    /// The user cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    /// The target's executable image could not be parsed.
    #[error("elf error: {0}")]
    Elf(#[from] goblin::error::Error),
    /// The target's debug info could not be read.
    #[error("dwarf error: {0}")]
    Dwarf(#[from] gimli::Error),
}

impl Error {
    /// An `Api` error capturing the current `errno`.
    pub(crate) fn last_os_error(context: impl Into<String>) -> Error {
        Error::Api {
            context: context.into(),
            source: io::Error::last_os_error(),
        }
    }
}

/// The result type returned by methods in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
