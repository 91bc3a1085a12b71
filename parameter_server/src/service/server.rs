use std::{io, path::PathBuf};

use comms::{
    DistMessage, DistMessageView, Handler, Reply,
    proto::{PullRequest, PushNotify},
};
use log::{debug, error, info, warn};

use crate::storage::ShardHandle;

/// What a connection did, logged once it closes.
#[derive(Debug, Default)]
pub struct Session {
    pulls: usize,
    pushes: usize,
}

/// The message handler of a parameter server shard.
pub struct ParamServer {
    shard: ShardHandle,
    out_model: PathBuf,
}

impl ParamServer {
    /// Creates a new `ParamServer`.
    ///
    /// # Arguments
    /// * `shard` - The shard to serve.
    /// * `out_model` - The root directory of the checkpoints saved on request.
    pub fn new(shard: ShardHandle, out_model: PathBuf) -> Self {
        Self { shard, out_model }
    }

    pub fn shard(&self) -> &ShardHandle {
        &self.shard
    }

    async fn on_save(&self, epoch: u32, timestamp: &str) -> DistMessage {
        match self.shard.save(&self.out_model, epoch, timestamp).await {
            Ok(path) => DistMessage::ModelSaveResponse {
                saved: true,
                path: path.display().to_string(),
            },
            Err(e) => {
                error!(epoch = epoch; "failed to save the model: {e}");
                DistMessage::ModelSaveResponse {
                    saved: false,
                    path: String::new(),
                }
            }
        }
    }
}

impl Handler for ParamServer {
    type Session = Session;

    async fn on_message(
        &self,
        session: &mut Session,
        msg: DistMessageView<'_>,
    ) -> io::Result<Reply> {
        let reply = match msg {
            DistMessageView::PullRequest(payload) => {
                let req: PullRequest = payload.decode()?;
                session.pulls += 1;
                Reply::Message(DistMessage::PullResponse(self.shard.pull(req).await))
            }
            DistMessageView::PushNotify(payload) => {
                let push: PushNotify = payload.decode()?;
                session.pushes += 1;
                self.shard.push(push).await?;
                Reply::None
            }
            DistMessageView::ModelSaveRequest { epoch, timestamp } => {
                Reply::Message(self.on_save(epoch, timestamp).await)
            }
            DistMessageView::TerminationNotify => {
                info!(shard = self.shard.shard_id(); "terminating");
                Reply::Shutdown
            }
            DistMessageView::EchoRequest => Reply::Message(DistMessage::EchoResponse),
            DistMessageView::UserRequest(_) => Reply::Message(DistMessage::UserResponse(Vec::new())),
            DistMessageView::HeartBeatNotify
            | DistMessageView::UserResponse(_)
            | DistMessageView::UserNotify(_) => Reply::None,
            msg => {
                warn!("unexpected {:?} on a parameter server", msg.kind());
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected message kind {:?}", msg.kind()),
                ));
            }
        };

        Ok(reply)
    }

    fn on_close(&self, session: Session) {
        debug!(pulls = session.pulls, pushes = session.pushes; "connection closed");
    }
}
