//! The accept loop and per connection read loops of the transport.

use std::{io, net::SocketAddr, sync::Arc};

use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};

use crate::{
    deserialize::from_bytes,
    msg::{DistMessage, DistMessageView},
};

/// What to do after a message has been handled.
#[derive(Debug)]
pub enum Reply {
    /// Nothing is written back.
    None,
    /// The message is written back on the same connection.
    Message(DistMessage),
    /// Nothing is written back and the whole server stops.
    Shutdown,
}

/// The message handling side of a server.
///
/// Every connection owns a `Session` that lives as long as the connection.
#[allow(unused)]
#[trait_variant::make(Handler: Send)]
pub trait LocalHandler: Sync {
    /// The state kept for every connection.
    type Session: Default + Send;

    /// Handles a message received on a connection.
    ///
    /// # Arguments
    /// * `session` - The connection's state.
    /// * `msg` - The received message, borrowing the connection's receive buffer.
    ///
    /// # Returns
    /// The reply, or an error which drops the connection without writing anything back.
    async fn on_message(
        &self,
        session: &mut Self::Session,
        msg: DistMessageView<'_>,
    ) -> io::Result<Reply>;

    /// Called once a connection is gone, whatever the reason.
    ///
    /// # Arguments
    /// * `session` - The connection's final state.
    fn on_close(&self, session: Self::Session) {
        drop(session);
    }
}

/// Serves connections accepted on `listener` until a handler asks for a shutdown.
///
/// The stop is cooperative: connections only observe it while waiting for their
/// next frame, so a message being handled always completes and its reply is written.
/// Returns once every connection task is over, the listener can be served again.
///
/// # Arguments
/// * `listener` - A bound listener.
/// * `handler` - The message handler shared by every connection.
///
/// # Returns
/// An io error if the local address of the listener can't be read.
pub async fn serve<H>(listener: &TcpListener, handler: Arc<H>) -> io::Result<()>
where
    H: Handler + 'static,
{
    let addr = listener.local_addr()?;
    let stop_tx = Arc::new(watch::Sender::new(false));
    let mut stop = stop_tx.subscribe();
    let mut tasks = JoinSet::new();

    info!("serving at {addr}");

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept a connection: {e}");
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set nodelay for {peer}: {e}");
                }

                debug!("accepted connection from {peer}");
                tasks.spawn(run_connection(stream, peer, Arc::clone(&handler), Arc::clone(&stop_tx)));
            }
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = res {
                    warn!("connection task failed: {e}");
                }
            }
        }
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!("connection task failed: {e}");
        }
    }

    info!("stopped serving at {addr}");
    Ok(())
}

/// The read loop of a single connection.
async fn run_connection<H>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    stop_tx: Arc<watch::Sender<bool>>,
) where
    H: Handler + 'static,
{
    let mut stop = stop_tx.subscribe();
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = crate::channel(rx, tx);
    let mut session = H::Session::default();
    let mut buf = Vec::new();

    let res: io::Result<()> = loop {
        if *stop.borrow_and_update() {
            break Ok(());
        }

        let frame = tokio::select! {
            biased;
            _ = stop.changed() => break Ok(()),
            frame = rx.recv_frame(&mut buf) => frame,
        };

        let reply = match frame.and_then(from_bytes::<DistMessageView>) {
            Ok(msg) => handler.on_message(&mut session, msg).await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(Reply::None) => {}
            Ok(Reply::Message(msg)) => {
                if let Err(e) = tx.send(&msg).await {
                    break Err(e);
                }
            }
            Ok(Reply::Shutdown) => {
                stop_tx.send_replace(true);
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    match res {
        Ok(()) => debug!("connection with {peer} closed"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("{peer} closed the connection")
        }
        Err(e) => warn!("dropping connection with {peer}: {e}"),
    }

    handler.on_close(session);
}
