use std::time::Duration;

use anyhow::bail;

pub struct TransportConfig {
    /// Upper bound for waiting on socket readiness. An event loop that sees neither incoming
    ///  data nor write readiness nor a wakeup for this long treats the connection as failed, so
    ///  this doubles as the idle timeout for a connection. Peers without regular traffic must
    ///  send keep-alive messages more frequently than this.
    ///
    /// The TLS handshake and the closing of the session are bounded by the same timeout.
    pub io_timeout: Duration,

    /// Frames announcing a longer payload are rejected, failing the connection. The receiver never
    ///  allocates more than this for a single frame.
    pub max_payload_len: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            io_timeout: Duration::from_secs(30),
            max_payload_len: 64*1024*1024,
        }
    }
}

impl TransportConfig {
    pub fn with_io_timeout(io_timeout: Duration) -> TransportConfig {
        TransportConfig {
            io_timeout,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.io_timeout.is_zero() {
            bail!("I/O timeout must be positive");
        }
        if self.max_payload_len == 0 {
            bail!("maximum payload length must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default(TransportConfig::default(), true)]
    #[case::zero_timeout(TransportConfig::with_io_timeout(Duration::ZERO), false)]
    #[case::zero_payload(TransportConfig { max_payload_len: 0, ..Default::default() }, false)]
    fn test_validate(#[case] config: TransportConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}
