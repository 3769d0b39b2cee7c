use std::time::Duration;

use anyhow::bail;

/// number of attempts to deliver a reliable or handshake packet before giving
///  up on the peer
pub(crate) const PACKET_RETRANSMISSIONS: u8 = 6;

/// duration to wait for a handshake response before resending SYNC or
///  SYNC CONFIG in the non-active states
pub(crate) const NON_ACTIVE_STATE_TIMEOUT: Duration = Duration::from_millis(250);

/// duration to wait after sending RESET, giving the peer time to come back
///  up before uart communication continues
pub(crate) const RESET_WAIT_DURATION: Duration = Duration::from_millis(300);

/// how long `open` waits for the link to become active after the handshake
///  was kicked off
pub(crate) const OPEN_WAIT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Construction-time configuration of an [`H5Transport`](crate::transport::H5Transport).
#[derive(Debug, Clone)]
pub struct H5Config {
    /// How long a reliable send waits for the peer's acknowledgement before
    ///  retransmitting the packet. The peer de-duplicates by sequence number,
    ///  so choosing this too small costs bandwidth but not correctness.
    pub retransmission_interval: Duration,
}

impl Default for H5Config {
    fn default() -> Self {
        H5Config {
            retransmission_interval: Duration::from_millis(250),
        }
    }
}

impl H5Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmission_interval.is_zero() {
            bail!("retransmission interval must not be zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(H5Config::default().validate().is_ok());
        assert!(H5Config {
            retransmission_interval: Duration::ZERO,
        }
        .validate()
        .is_err());
    }
}
