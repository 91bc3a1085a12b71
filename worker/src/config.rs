use std::{net::SocketAddr, time::Duration};

use comms::Retry;
use serde::Deserialize;

use crate::error::{Result, WorkerErr};

/// The configuration of a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub coordinator: SocketAddr,
    /// The parameter servers, in shard order.
    pub ps_endpoints: Vec<SocketAddr>,
    pub epoch: u32,
    /// Seconds to wait before asking again when the coordinator has no file.
    pub idle_backoff: u64,
    pub connect_retries: usize,
    pub connect_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let retry = Retry::default();

        Self {
            coordinator: SocketAddr::from(([127, 0, 0, 1], 61001)),
            ps_endpoints: Vec::new(),
            epoch: 1,
            idle_backoff: 5,
            connect_retries: retry.retries,
            connect_interval_ms: retry.interval.as_millis() as u64,
        }
    }
}

impl WorkerConfig {
    /// Checks the configuration.
    ///
    /// # Returns
    /// An `InvalidConfig` error if there are no endpoints or no epochs.
    pub fn validate(self) -> Result<Self> {
        if self.ps_endpoints.is_empty() {
            return Err(WorkerErr::InvalidConfig("ps_endpoints must not be empty".into()));
        }

        if self.epoch == 0 {
            return Err(WorkerErr::InvalidConfig("epoch must be greater than 0".into()));
        }

        Ok(self)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_secs(self.idle_backoff)
    }

    pub fn retry(&self) -> Retry {
        Retry {
            retries: self.connect_retries,
            interval: Duration::from_millis(self.connect_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use comms::config;

    use super::*;

    #[test]
    fn defaults_back_off_five_seconds() {
        let config = WorkerConfig::default();
        assert_eq!(config.idle_backoff(), Duration::from_secs(5));
        assert_eq!(config.retry(), Retry::default());
    }

    #[test]
    fn validate_rejects_empty_jobs() {
        assert!(matches!(
            WorkerConfig::default().validate(),
            Err(WorkerErr::InvalidConfig(_))
        ));

        let config = WorkerConfig {
            ps_endpoints: vec!["127.0.0.1:9000".parse().unwrap()],
            epoch: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WorkerErr::InvalidConfig(_))));
    }

    #[test]
    fn overrides_are_applied() {
        let config: WorkerConfig = config::load(
            None,
            r#"ps_endpoints=["127.0.0.1:9000","127.0.0.1:9001"];idle_backoff=1"#,
        )
        .unwrap();

        assert_eq!(config.ps_endpoints.len(), 2);
        assert_eq!(config.idle_backoff(), Duration::from_secs(1));
    }
}
