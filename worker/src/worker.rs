use std::{io, net::SocketAddr, time::Duration};

use comms::{Connection, DistMessage, Retry};
use log::{debug, error, info, warn};
use tokio::time;

use crate::{config::WorkerConfig, error::Result, middleware::Middleware};

/// What a trained file reports back to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStats {
    /// The summed loss over the file.
    pub loss: f64,
    /// What `loss` has to be divided by to get the mean, usually the amount of samples.
    pub loss_weight: f64,
}

/// The model side of a worker: reads a file and trains on it, pulling
/// parameters and pushing gradients through the middleware.
#[allow(unused)]
#[trait_variant::make(Trainer: Send)]
pub trait LocalTrainer {
    /// Trains on a single file.
    ///
    /// # Arguments
    /// * `file` - The file handed out by the coordinator.
    /// * `middleware` - The parameter servers.
    ///
    /// # Returns
    /// The loss over the file, an error gives the file back to the coordinator.
    async fn train_file(&mut self, file: &str, middleware: &mut Middleware) -> Result<FileStats>;
}

/// Infrastructure worker runtime.
///
/// Asks the coordinator for files until it runs out of them, once per epoch.
pub struct Worker {
    middleware: Middleware,
    epochs: u32,
    idle_backoff: Duration,
    retry: Retry,
}

impl Worker {
    /// Creates a new `Worker` connected to every parameter server.
    ///
    /// # Arguments
    /// * `config` - A validated configuration, see `WorkerConfig::validate`.
    pub async fn connect(config: &WorkerConfig) -> Result<Self> {
        let middleware = Middleware::connect(&config.ps_endpoints, config.retry()).await?;
        Ok(Self::new(middleware, config))
    }

    /// Creates a new `Worker` on top of an existing middleware.
    pub fn new(middleware: Middleware, config: &WorkerConfig) -> Self {
        Self {
            middleware,
            epochs: config.epoch,
            idle_backoff: config.idle_backoff(),
            retry: config.retry(),
        }
    }

    pub fn middleware(&mut self) -> &mut Middleware {
        &mut self.middleware
    }

    pub fn into_middleware(self) -> Middleware {
        self.middleware
    }

    /// Runs every epoch against the coordinator at `coord_addr`.
    ///
    /// An epoch is over once the coordinator closes the connection, the worker
    /// stops early if it can't reach the coordinator anymore. Connections closed
    /// before any file request was answered don't count as an epoch.
    ///
    /// # Arguments
    /// * `coord_addr` - The coordinator's address.
    /// * `trainer` - The model's trainer.
    ///
    /// # Returns
    /// The amount of epochs run, or the first trainer or parameter server error.
    pub async fn run<T: Trainer>(&mut self, coord_addr: SocketAddr, trainer: &mut T) -> Result<u32> {
        let mut epochs = 0;
        let mut hang_ups = 0;

        while epochs < self.epochs {
            let mut coord = match Connection::connect_retry(coord_addr, self.retry).await {
                Ok(coord) => coord,
                Err(e) => {
                    warn!("coordinator {coord_addr} unreachable: {e}");
                    break;
                }
            };

            match self.run_epoch(&mut coord, trainer).await? {
                Some(_) => {
                    epochs += 1;
                    hang_ups = 0;
                }
                None if hang_ups < self.retry.retries => {
                    hang_ups += 1;
                    debug!("coordinator {coord_addr} hung up before answering");
                    time::sleep(self.retry.interval).await;
                }
                None => {
                    warn!("coordinator {coord_addr} keeps hanging up");
                    break;
                }
            }
        }

        info!(epochs = epochs; "worker finished");
        Ok(epochs)
    }

    /// Trains files until the coordinator hangs up.
    ///
    /// # Returns
    /// The epoch reported by the coordinator, `None` if it never answered.
    async fn run_epoch<T: Trainer>(
        &mut self,
        coord: &mut Connection,
        trainer: &mut T,
    ) -> Result<Option<u32>> {
        let mut current = None;
        let mut files = 0;

        loop {
            let (epoch, file) = match request_file(coord).await {
                Ok(response) => response,
                Err(e) => {
                    debug!("coordinator {} hung up: {e}", coord.peer());
                    break;
                }
            };

            if current.is_none() {
                info!(epoch = epoch + 1; "epoch begins");
            }
            current = Some(epoch);

            if file.is_empty() {
                debug!("no file available, backing off");
                time::sleep(self.idle_backoff).await;
                continue;
            }

            debug!(epoch = epoch + 1; "training on {file}");

            let stats = match trainer.train_file(&file, &mut self.middleware).await {
                Ok(stats) => stats,
                Err(e) => {
                    error!("training on {file} failed: {e}");
                    return Err(e);
                }
            };

            let msg = DistMessage::FileFinishNotify {
                file,
                loss: stats.loss,
                loss_weight: stats.loss_weight,
            };

            if let Err(e) = coord.send(&msg).await {
                debug!("coordinator {} hung up: {e}", coord.peer());
                break;
            }

            files += 1;
        }

        if let Some(epoch) = current {
            info!(epoch = epoch + 1, files = files; "epoch completed");
        }

        Ok(current)
    }
}

/// Asks the coordinator for a file.
///
/// # Returns
/// The current epoch and the file, empty if there is none right now.
async fn request_file(coord: &mut Connection) -> io::Result<(u32, String)> {
    match coord.rpc(&DistMessage::FileRequest).await? {
        Some(DistMessage::FileResponse { epoch, file }) => Ok((epoch, file)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected a FileResponse",
        )),
    }
}
