use std::{env, io, path::PathBuf, sync::Arc};

use comms::config;
use coordinator::{CoordConfig, CoordServer};
use log::info;
use tokio::{net::TcpListener, runtime, signal};

fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = args.next().or_else(|| env::var("CONFIG").ok()).map(PathBuf::from);
    let overrides = args
        .next()
        .or_else(|| env::var("CONFIG_OVERRIDES").ok())
        .unwrap_or_default();

    let config: CoordConfig = config::load(path.as_deref(), &overrides)?;
    let config = config.resolve()?;

    // A single I/O thread serves every worker.
    let runtime = runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let listener = TcpListener::bind(config.listen).await?;
        info!(
            files = config.files.len(),
            servers = config.ps_endpoints.len();
            "coordinator listening at {}", config.listen
        );

        let server = Arc::new(CoordServer::new(config));

        tokio::select! {
            res = server.run(&listener) => res?,
            _ = signal::ctrl_c() => info!("interrupted"),
        }

        Ok::<_, io::Error>(())
    })
}
