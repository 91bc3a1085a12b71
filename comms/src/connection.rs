//! The client side of the transport: outbound connections and fan-out to many peers.

use std::{io, net::SocketAddr, time::Duration};

use futures::future;
use log::{info, warn};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{
    MsgReceiver, MsgSender,
    msg::{DistMessage, DistMessageView},
};

/// How many times and how often a connection attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub retries: usize,
    pub interval: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            retries: 100,
            interval: Duration::from_secs(3),
        }
    }
}

/// An outbound connection speaking `DistMessage`s.
pub struct Connection {
    peer: SocketAddr,
    rx: MsgReceiver<OwnedReadHalf>,
    tx: MsgSender<OwnedWriteHalf>,
    buf: Vec<u8>,
}

impl Connection {
    /// Connects to `addr`.
    ///
    /// # Arguments
    /// * `addr` - The address of the server.
    ///
    /// # Returns
    /// A new `Connection` or an io error if the server can't be reached.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (rx, tx) = crate::channel(rx, tx);

        Ok(Self {
            peer: addr,
            rx,
            tx,
            buf: Vec::new(),
        })
    }

    /// Connects to `addr`, retrying on failure.
    ///
    /// # Arguments
    /// * `addr` - The address of the server.
    /// * `retry` - How many times and how often to retry.
    ///
    /// # Returns
    /// A new `Connection` or the last connection error.
    pub async fn connect_retry(addr: SocketAddr, retry: Retry) -> io::Result<Self> {
        let mut attempt = 0;

        loop {
            match Self::connect(addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < retry.retries => {
                    attempt += 1;
                    warn!("failed to connect to {addr} ({e}), retry {attempt}/{}", retry.retries);
                    time::sleep(retry.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the address of the server.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends `msg` without waiting for anything.
    pub async fn send(&mut self, msg: &DistMessage) -> io::Result<()> {
        self.tx.send(msg).await
    }

    /// Waits for the next message and returns it in its borrowed form.
    pub async fn recv_view(&mut self) -> io::Result<DistMessageView<'_>> {
        self.rx.recv_into(&mut self.buf).await
    }

    /// Waits for the next message.
    pub async fn recv(&mut self) -> io::Result<DistMessage> {
        self.recv_view().await?.to_message()
    }

    /// Sends `msg` and, if its kind requires one, waits for the response.
    ///
    /// # Arguments
    /// * `msg` - The request or notification to send.
    ///
    /// # Returns
    /// The response, `None` for fire and forget kinds, or an `InvalidData` error
    /// if the peer answered with the wrong kind.
    pub async fn rpc(&mut self, msg: &DistMessage) -> io::Result<Option<DistMessage>> {
        self.send(msg).await?;

        let Some(expected) = msg.kind().response() else {
            return Ok(None);
        };

        let response = self.recv().await?;

        if response.kind() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expected {expected:?} from {}, got {:?}",
                    self.peer,
                    response.kind()
                ),
            ));
        }

        Ok(Some(response))
    }

    /// Closes the connection.
    pub async fn close(mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}

/// A group of connections, one per endpoint, driven concurrently.
pub struct Connections {
    conns: Vec<Connection>,
}

impl Connections {
    /// Connects to every endpoint, retrying each of them on failure.
    ///
    /// # Arguments
    /// * `endpoints` - The addresses of the servers, in shard order.
    /// * `retry` - How many times and how often to retry each endpoint.
    ///
    /// # Returns
    /// The connections in the same order as `endpoints`.
    pub async fn connect_retry(endpoints: &[SocketAddr], retry: Retry) -> io::Result<Self> {
        let futs = endpoints
            .iter()
            .map(|&addr| Connection::connect_retry(addr, retry));

        let conns = future::try_join_all(futs).await?;
        info!("connected to {} endpoints", conns.len());
        Ok(Self { conns })
    }

    /// Returns the amount of connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Returns `true` if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Sends one message per connection, skipping the `None` entries, and waits for the responses.
    ///
    /// # Arguments
    /// * `msgs` - A message per connection, in the same order as the connections.
    ///
    /// # Returns
    /// A response per connection, `None` where nothing was sent or nothing was expected.
    pub async fn rpc_masked(
        &mut self,
        msgs: Vec<Option<DistMessage>>,
    ) -> io::Result<Vec<Option<DistMessage>>> {
        if msgs.len() != self.conns.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("got {} messages for {} connections", msgs.len(), self.conns.len()),
            ));
        }

        let futs = self
            .conns
            .iter_mut()
            .zip(msgs)
            .map(async |(conn, msg)| match msg {
                Some(msg) => conn.rpc(&msg).await,
                None => Ok(None),
            });

        future::try_join_all(futs).await
    }

    /// Sends the same message to every connection and waits for the responses.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// A response per connection, `None` for fire and forget kinds.
    pub async fn broadcast(&mut self, msg: &DistMessage) -> io::Result<Vec<Option<DistMessage>>> {
        let futs = self.conns.iter_mut().map(|conn| conn.rpc(msg));
        future::try_join_all(futs).await
    }

    /// Closes every connection.
    pub async fn close(self) -> io::Result<()> {
        let futs = self.conns.into_iter().map(Connection::close);
        future::try_join_all(futs).await?;
        Ok(())
    }
}
