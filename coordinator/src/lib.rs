pub mod config;
pub mod dispatcher;
pub mod error;
mod server;

pub use config::CoordConfig;
pub use dispatcher::{Counts, FileDispatcher};
pub use error::CoordErr;
pub use server::{CoordServer, Session};
