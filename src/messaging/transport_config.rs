use std::time::Duration;

use anyhow::bail;

use crate::ordering::DeliveryMode;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// time to wait for an acknowledgement before re-sending
    pub interval: Duration,
    /// number of re-sends after the initial send
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Broadcasts are best-effort fan-out: a short interval and few retries
    pub broadcast_retry: RetryPolicy,
    /// Private messages go to a single peer, so they are retried for longer
    pub private_retry: RetryPolicy,

    /// Time after sending a broadcast at which the number of acknowledging nodes is reported
    pub broadcast_observation_window: Duration,

    /// Size of the receive buffer. Longer datagrams are truncated by the OS and then fail to
    ///  parse.
    pub max_datagram_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            broadcast_retry: RetryPolicy {
                interval: Duration::from_secs(1),
                max_retries: 2,
            },
            private_retry: RetryPolicy {
                interval: Duration::from_secs(2),
                max_retries: 5,
            },
            broadcast_observation_window: Duration::from_secs(3),
            max_datagram_size: 4096,
        }
    }
}

impl TransportConfig {
    pub fn retry_policy(&self, mode: DeliveryMode) -> RetryPolicy {
        match mode {
            DeliveryMode::Broadcast => self.broadcast_retry,
            DeliveryMode::Private => self.private_retry,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broadcast_retry.interval.is_zero() || self.private_retry.interval.is_zero() {
            bail!("retry intervals must be positive");
        }
        if self.max_datagram_size < 64 {
            bail!("max datagram size {} is too small", self.max_datagram_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policy(DeliveryMode::Broadcast), RetryPolicy { interval: Duration::from_secs(1), max_retries: 2 });
        assert_eq!(config.retry_policy(DeliveryMode::Private), RetryPolicy { interval: Duration::from_secs(2), max_retries: 5 });
    }

    #[test]
    fn test_validate() {
        let mut config = TransportConfig::default();
        config.private_retry.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.max_datagram_size = 10;
        assert!(config.validate().is_err());
    }
}
