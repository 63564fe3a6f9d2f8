use std::io;
use std::time::Duration;

use thiserror::Error;

/// Everything that can end a connection. Any of these is terminal for the reactor that
///  encounters it: the connection is marked failed and never recovers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("no socket readiness for {0:?}")]
    Timeout(Duration),
    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: u64, max: u64 },
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection lost")]
    ConnectionLost,
}

impl From<io::Error> for TransportError {
    /// tokio-rustls reports protocol violations as I/O errors wrapping a [rustls::Error]
    fn from(e: io::Error) -> Self {
        let is_tls = e
            .get_ref()
            .map(|inner| inner.is::<rustls::Error>())
            .unwrap_or(false);

        if is_tls {
            TransportError::Tls(e.to_string())
        }
        else {
            TransportError::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain_io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"), false)]
    #[case::tls(io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError), true)]
    fn test_from_io(#[case] e: io::Error, #[case] expected_tls: bool) {
        let converted = TransportError::from(e);
        assert_eq!(matches!(converted, TransportError::Tls(_)), expected_tls);
    }
}
