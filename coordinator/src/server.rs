use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use comms::{Connections, DistMessage, DistMessageView, Handler, Reply};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::{
    config::CoordConfig,
    dispatcher::FileDispatcher,
    error::{CoordErr, Result},
};

/// The files handed out through a worker's connection and not finished yet.
#[derive(Debug, Default)]
pub struct Session {
    files: HashSet<String>,
}

/// The sum of the losses reported during an epoch.
#[derive(Debug, Default, Clone, Copy)]
struct Loss {
    loss: f64,
    weight: f64,
}

impl Loss {
    fn mean(&self) -> f64 {
        if self.weight > 0. {
            self.loss / self.weight
        } else {
            0.
        }
    }
}

/// Drives the epochs of a training job: hands files to workers and tells the
/// parameter servers when to save and when to stop.
pub struct CoordServer {
    config: CoordConfig,
    dispatcher: FileDispatcher,
    epoch: AtomicU32,
    loss: Mutex<Loss>,
}

impl CoordServer {
    /// Creates a new `CoordServer`.
    ///
    /// # Arguments
    /// * `config` - A resolved configuration, see `CoordConfig::resolve`.
    pub fn new(config: CoordConfig) -> Self {
        let dispatcher =
            FileDispatcher::new(config.reverse, config.shuffle, config.timeout(), config.seed);

        Self {
            config,
            dispatcher,
            epoch: AtomicU32::new(0),
            loss: Mutex::new(Loss::default()),
        }
    }

    pub fn dispatcher(&self) -> &FileDispatcher {
        &self.dispatcher
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Runs every epoch on `listener`, then stops the parameter servers.
    ///
    /// # Returns
    /// A `CoordErr` if the listener fails or the parameter servers can't be reached.
    pub async fn run(self: Arc<Self>, listener: &TcpListener) -> Result<()> {
        self.pre_train();

        for epoch in 0..self.config.epoch {
            self.epoch.store(epoch, Ordering::Release);
            self.pre_epoch();
            info!(epoch = epoch + 1; "epoch begins");

            comms::serve(listener, Arc::clone(&self)).await?;

            let loss = std::mem::take(&mut *self.loss.lock());
            info!(epoch = epoch + 1, loss = loss.mean(); "epoch completed");
            self.post_epoch().await?;
        }

        self.post_train();
        self.terminate_ps().await
    }

    fn pre_train(&self) {
        self.dispatcher.pre_train(self.config.files.clone());
    }

    fn pre_epoch(&self) {
        self.dispatcher.pre_epoch();
    }

    async fn post_epoch(&self) -> Result<()> {
        if self.config.dump_model {
            self.dump_model().await?;
        }

        Ok(())
    }

    fn post_train(&self) {
        debug!("training completed");
    }

    /// Asks every parameter server to save its shard of the model.
    ///
    /// # Returns
    /// A `SaveFailed` error naming the first parameter server that didn't save.
    pub async fn dump_model(&self) -> Result<()> {
        let epoch = self.epoch();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default();

        let mut conns = self.connect_ps().await?;
        let msg = DistMessage::ModelSaveRequest { epoch, timestamp };
        let responses = conns.broadcast(&msg).await?;

        for (&addr, response) in self.config.ps_endpoints.iter().zip(responses) {
            match response {
                Some(DistMessage::ModelSaveResponse { saved: true, path }) => {
                    info!(epoch = epoch + 1; "{addr} saved the model to {path}");
                }
                _ => {
                    error!(epoch = epoch + 1; "{addr} failed to save the model");
                    return Err(CoordErr::SaveFailed { addr, epoch });
                }
            }
        }

        conns.close().await?;
        Ok(())
    }

    /// Sends a `TerminationNotify` to every parameter server.
    pub async fn terminate_ps(&self) -> Result<()> {
        let mut conns = self.connect_ps().await?;
        conns.broadcast(&DistMessage::TerminationNotify).await?;
        info!("parameter servers terminated");
        Ok(())
    }

    async fn connect_ps(&self) -> Result<Connections> {
        let addrs = &self.config.ps_endpoints;

        Connections::connect_retry(addrs, self.config.retry())
            .await
            .map_err(|source| CoordErr::ConnectionFailed {
                addrs: addrs.clone(),
                source,
            })
    }

    fn on_file_finish(&self, session: &mut Session, file: &str, loss: f64, loss_weight: f64) -> Reply {
        session.files.remove(file);

        if !self.dispatcher.finish(file) {
            warn!("stale finish of file {file}");
            return Reply::None;
        }

        {
            let mut total = self.loss.lock();
            total.loss += loss;
            total.weight += loss_weight;
        }

        let mean = if loss_weight > 0. { loss / loss_weight } else { 0. };
        info!(loss = mean; "file {file} finished");

        if self.dispatcher.is_epoch_complete() {
            return Reply::Shutdown;
        }

        Reply::None
    }
}

impl Handler for CoordServer {
    type Session = Session;

    async fn on_message(
        &self,
        session: &mut Session,
        msg: DistMessageView<'_>,
    ) -> io::Result<Reply> {
        let reply = match msg {
            DistMessageView::FileRequest => {
                let file = self.dispatcher.dispatch();
                if let Some(file) = &file {
                    session.files.insert(file.clone());
                }

                Reply::Message(DistMessage::FileResponse {
                    epoch: self.epoch(),
                    file: file.unwrap_or_default(),
                })
            }
            DistMessageView::FileFinishNotify {
                file,
                loss,
                loss_weight,
            } => self.on_file_finish(session, file, loss, loss_weight),
            DistMessageView::EchoRequest => Reply::Message(DistMessage::EchoResponse),
            DistMessageView::UserRequest(_) => Reply::Message(DistMessage::UserResponse(Vec::new())),
            DistMessageView::HeartBeatNotify
            | DistMessageView::UserResponse(_)
            | DistMessageView::UserNotify(_) => Reply::None,
            msg => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected message kind {:?}", msg.kind()),
                ));
            }
        };

        Ok(reply)
    }

    fn on_close(&self, session: Session) {
        for file in session.files {
            self.dispatcher.failure(&file);
        }
    }
}
