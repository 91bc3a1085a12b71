pub mod config;
mod connection;
mod deserialize;
pub mod msg;
pub mod proto;
mod receiver;
mod sender;
mod serialize;
mod server;

use tokio::io::{AsyncRead, AsyncWrite};

pub use connection::{Connection, Connections, Retry};
pub use deserialize::{ByteReader, Deserialize, from_bytes};
pub use msg::{DistMessage, DistMessageView, MsgKind, Payload};
pub use receiver::MsgReceiver;
pub use sender::MsgSender;
pub use serialize::{Serialize, serialize_len, serialize_nested};
pub use server::{Handler, LocalHandler, Reply, serve};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The largest frame body a receiver accepts.
pub const MAX_FRAME_LEN: LenType = 1 << 30;

/// Creates both `MsgReceiver` and `MsgSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a message receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (MsgReceiver<R>, MsgSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (MsgReceiver::new(rx), MsgSender::new(tx))
}
