use std::{env, io, path::PathBuf, sync::Arc};

use comms::config;
use log::info;
use parameter_server::{ModelShard, ParamServer, ServerConfig, ShardHandle};
use tokio::{net::TcpListener, runtime, signal};

fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = args.next().or_else(|| env::var("CONFIG").ok()).map(PathBuf::from);
    let overrides = args
        .next()
        .or_else(|| env::var("CONFIG_OVERRIDES").ok())
        .unwrap_or_default();

    let config: ServerConfig = config::load(path.as_deref(), &overrides)?;

    let runtime = runtime::Builder::new_multi_thread()
        .worker_threads(config.thread.get())
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> io::Result<()> {
    let shard = ModelShard::build(&config)?;
    info!(
        shard = config.shard_id,
        shards = config.shard_count.get(),
        dense = shard.model().dense_params().count(),
        sparse = shard.model().sparse_tables().count();
        "parameter server shard ready"
    );

    let listener = TcpListener::bind(config.listen).await?;
    info!("listening at {}", config.listen);

    let server = Arc::new(ParamServer::new(ShardHandle::new(shard), config.out_model));

    tokio::select! {
        res = comms::serve(&listener, server) => res?,
        _ = signal::ctrl_c() => info!("interrupted"),
    }

    Ok(())
}
