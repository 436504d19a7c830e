use std::io;

/// Failure kinds a mirror run can surface to its caller.
///
/// Low-level I/O and zlib failures are translated into one of these at the
/// pack-reader / protocol-driver boundary; the caller decides whether to
/// retry the repository.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte channel to the remote died (closed pipe, timeout, non-zero
    /// transport exit). The cached state is kept as-is.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed pkt-line or an unexpected negotiation response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad pack signature/version, truncation, or a corrupt deflate stream.
    #[error("pack format error: {0}")]
    Pack(String),

    /// Corrupt delta payload, a base object that never arrived, or an
    /// unsupported delta kind.
    #[error("delta error: {0}")]
    Delta(String),

    /// The on-disk collection file cannot be trusted. The caller deletes it
    /// and starts cold.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("unsupported repository url '{0}'")]
    Url(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
