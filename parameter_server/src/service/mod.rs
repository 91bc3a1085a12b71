mod server;

pub use server::{ParamServer, Session};
