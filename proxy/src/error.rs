//! Error taxonomy
//!
//! One small `thiserror` enum per component, plus a top-level `RevampError` that the
//! frontends match on to decide the client-visible outcome (pass-through, `502`, or a closed
//! connection).

use thiserror::Error;

/// Malformed bytes on the wire from a client (HTTP or SOCKS5). Always fatal to the
/// connection; never retried.
#[derive(Debug, Error)]
pub enum ClientProtocolError {
    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),
    #[error("unsupported SOCKS5 version byte: {0}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported SOCKS5 address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("connection closed before a complete request was read")]
    UnexpectedEof,
    #[error("header parse error: {0}")]
    InvalidHeader(String),
}

/// Failure while talking to the origin server.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake with origin failed: {0}")]
    Tls(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure minting or loading a certificate.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),
    #[error("failed to build certificate parameters: {0}")]
    Params(String),
    #[error("failed to sign certificate: {0}")]
    Signing(String),
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure in the transform pool or the transform itself.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A parse/transform error the transformer itself judged benign (e.g. a duplicate
    /// `let`/`const` declaration). Callers should return the original bytes unchanged and
    /// must not log at warn level.
    #[error("ignorable transform error: {0}")]
    Ignorable(String),
    /// Any other transform failure. Callers fall back to the original bytes and log a warning.
    #[error("transform failed: {0}")]
    Failed(String),
    #[error("transformer pool queue is closed")]
    PoolClosed,
}

impl TransformError {
    pub fn is_ignorable(&self) -> bool {
        matches!(self, TransformError::Ignorable(_))
    }
}

/// Failure reading or writing the on-disk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache metadata corrupt: {0}")]
    CorruptMetadata(String),
}

/// Unrecoverable startup failure. The process should log and exit non-zero.
#[derive(Debug, Error)]
pub enum FatalInit {
    #[error("failed to load or generate the certificate authority: {0}")]
    Ca(#[source] CertError),
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error type threaded through the frontends.
#[derive(Debug, Error)]
pub enum RevampError {
    #[error(transparent)]
    ClientProtocol(#[from] ClientProtocolError),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    FatalInit(#[from] FatalInit),
}

impl RevampError {
    /// Whether this error should be surfaced to the client as `502 Bad Gateway` rather than
    /// degraded locally. Only origin failures produce a lie if swallowed silently.
    pub fn is_bad_gateway(&self) -> bool {
        matches!(self, RevampError::Origin(_))
    }
}
