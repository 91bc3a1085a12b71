use std::{fs, net::SocketAddr, path::PathBuf, time::Duration};

use comms::Retry;
use serde::Deserialize;

use crate::error::{CoordErr, Result};

/// The configuration of the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordConfig {
    pub listen: SocketAddr,
    /// The parameter servers, in shard order.
    pub ps_endpoints: Vec<SocketAddr>,
    pub files: Vec<String>,
    /// A file listing one training file per line, appended to `files`.
    pub file_list: Option<PathBuf>,
    pub epoch: u32,
    pub reverse: bool,
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Seconds a file may stay in flight, `0` disables reclamation.
    pub timeout: u64,
    /// Ask every parameter server to save the model after each epoch.
    pub dump_model: bool,
    pub connect_retries: usize,
    pub connect_interval_ms: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        let retry = Retry::default();

        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 61001)),
            ps_endpoints: Vec::new(),
            files: Vec::new(),
            file_list: None,
            epoch: 1,
            reverse: false,
            shuffle: false,
            seed: None,
            timeout: 0,
            dump_model: false,
            connect_retries: retry.retries,
            connect_interval_ms: retry.interval.as_millis() as u64,
        }
    }
}

impl CoordConfig {
    /// Reads `file_list` into `files` and checks the configuration.
    ///
    /// # Returns
    /// An `InvalidConfig` error if there are no endpoints, no files or no epochs.
    pub fn resolve(mut self) -> Result<Self> {
        if let Some(path) = self.file_list.take() {
            let list = fs::read_to_string(&path)?;
            self.files.extend(
                list.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        }

        if self.ps_endpoints.is_empty() {
            return Err(CoordErr::InvalidConfig("ps_endpoints must not be empty".into()));
        }

        if self.files.is_empty() {
            return Err(CoordErr::InvalidConfig("there are no files to train on".into()));
        }

        if self.epoch == 0 {
            return Err(CoordErr::InvalidConfig("epoch must be greater than 0".into()));
        }

        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry(&self) -> Retry {
        Retry {
            retries: self.connect_retries,
            interval: Duration::from_millis(self.connect_interval_ms),
        }
    }
}
