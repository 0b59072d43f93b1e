//! Error kinds surfaced by the core (spec §7).
//!
//! Request threads never observe these: `Buffer` and `Flusher` absorb every
//! failure internally and either count it or forward it to a pluggable
//! `error_handler`. `BufferDropped` has no variant here because spec §7
//! requires it be "observed via counter, never raised".

use std::fmt;

/// Failure modes the core can produce internally.
#[derive(Debug)]
pub enum Error {
    /// A `PersistenceAdapter` was asked to do something it does not support
    /// (e.g. a backend-specific operation called against the wrong backend).
    /// Startup-fatal per spec §7.
    AdapterUnsupported(String),
    /// A flush-cycle persist operation failed; routed to the `CircuitBreaker`
    /// and the drained events re-queued per the configured policy.
    PersistFailure(String),
    /// A TDigest blob failed to deserialize. Treated as an empty digest by
    /// the caller and logged once, not propagated further.
    DigestCorrupt(String),
    /// A serialization round-trip failed (context/metadata JSON, digest
    /// bincode). Surfaced as `PersistFailure` by callers per spec §7.
    SerializationError(String),
    /// Wraps a lower-level I/O failure (adapter transaction setup, WAL-style
    /// recovery in future adapters).
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AdapterUnsupported(msg) => write!(f, "adapter does not support: {msg}"),
            Error::PersistFailure(msg) => write!(f, "persist failed: {msg}"),
            Error::DigestCorrupt(msg) => write!(f, "digest corrupt: {msg}"),
            Error::SerializationError(msg) => write!(f, "serialization error: {msg}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
