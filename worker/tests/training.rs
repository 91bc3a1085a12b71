use std::{net::SocketAddr, num::NonZeroUsize, sync::Arc, time::Duration};

use comms::proto::{DenseTensor, Id, PullRequest, PushNotify, SparseRows, Tensor, TensorMap};
use coordinator::{CoordConfig, CoordServer};
use parameter_server::{
    ModelShard, ParamServer, ServerConfig, ShardHandle,
    initialization::Initializer,
    storage::{Graph, ParamDecl},
};
use tokio::{net::TcpListener, task::JoinHandle, time};
use worker::{FileStats, Middleware, Trainer, Worker, WorkerConfig};

const IDS: [Id; 4] = [1, 2, 3, 4];

/// Pulls every parameter and pushes a gradient of ones for each of them.
#[derive(Default)]
struct OnesTrainer {
    files: Vec<String>,
    last: TensorMap,
}

impl Trainer for OnesTrainer {
    async fn train_file(&mut self, file: &str, middleware: &mut Middleware) -> worker::Result<FileStats> {
        let mut req = PullRequest {
            is_train: true,
            ..Default::default()
        };
        req.tsr_set.insert("bias".into());
        req.srm_map.insert("emb".into(), IDS.into_iter().collect());
        self.last = middleware.pull(&req).await?;

        let mut emb = SparseRows::new(2);
        emb.rows.extend(IDS.map(|id| (id, vec![1., 1.])));
        let bias = DenseTensor::from_data(vec![1], vec![1.])?;

        let push = PushNotify {
            grad: TensorMap::from([
                ("emb".to_string(), Tensor::Sparse(emb)),
                ("bias".to_string(), Tensor::Dense(bias)),
            ]),
            overwritten: TensorMap::new(),
        };
        middleware.push(push).await?;

        self.files.push(file.to_string());
        Ok(FileStats {
            loss: 1.,
            loss_weight: 1.,
        })
    }
}

async fn spawn_ps(shard_id: usize, shard_count: usize) -> (SocketAddr, JoinHandle<()>) {
    let config = ServerConfig {
        shard_id,
        shard_count: NonZeroUsize::new(shard_count).unwrap(),
        graph: Graph::new(vec![
            ParamDecl::dense("bias", vec![1], Initializer::Zeros),
            ParamDecl::sparse("emb", 2, Initializer::Constant { value: 0.5 }),
        ]),
        optimizer_config: "alpha=0.5;batch_decay=0".to_string(),
        ..Default::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shard = ShardHandle::new(ModelShard::build(&config).unwrap());
    let server = Arc::new(ParamServer::new(shard, config.out_model));
    let task = tokio::spawn(async move { comms::serve(&listener, server).await.unwrap() });

    (addr, task)
}

async fn spawn_coordinator(ps: Vec<SocketAddr>, epoch: u32) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = CoordConfig {
        listen: addr,
        ps_endpoints: ps,
        files: vec!["part-0".into(), "part-1".into(), "part-2".into()],
        epoch,
        connect_retries: 3,
        connect_interval_ms: 100,
        ..Default::default()
    }
    .resolve()
    .unwrap();

    let server = Arc::new(CoordServer::new(config));
    let task = tokio::spawn(async move { server.run(&listener).await.unwrap() });

    (addr, task)
}

fn worker_config(ps: Vec<SocketAddr>, epoch: u32) -> WorkerConfig {
    WorkerConfig {
        ps_endpoints: ps,
        epoch,
        idle_backoff: 1,
        connect_retries: 3,
        connect_interval_ms: 100,
        ..Default::default()
    }
    .validate()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn one_worker_trains_every_file_of_every_epoch() {
    let (ps0, ps0_task) = spawn_ps(0, 2).await;
    let (ps1, ps1_task) = spawn_ps(1, 2).await;
    let (coord, coord_task) = spawn_coordinator(vec![ps0, ps1], 2).await;

    let config = worker_config(vec![ps0, ps1], 2);
    let mut worker = Worker::connect(&config).await.unwrap();
    let mut trainer = OnesTrainer::default();

    let epochs = time::timeout(Duration::from_secs(30), worker.run(coord, &mut trainer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(epochs, 2);

    let mut files = trainer.files.clone();
    files.sort();
    files.dedup();
    assert_eq!(trainer.files.len(), 6);
    assert_eq!(files, ["part-0", "part-1", "part-2"]);

    // The last pull saw the effect of the five pushes before it.
    let Tensor::Sparse(emb) = &trainer.last["emb"] else {
        panic!("expected sparse rows");
    };
    assert_eq!(emb.len(), IDS.len());
    for row in emb.rows.values() {
        assert_eq!(row, &[-2., -2.]);
    }

    let Tensor::Dense(bias) = &trainer.last["bias"] else {
        panic!("expected a dense tensor");
    };
    assert_eq!(bias.data, [-2.5]);

    coord_task.await.unwrap();
    ps0_task.await.unwrap();
    ps1_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn an_unreachable_coordinator_stops_the_worker() {
    let (ps, ps_task) = spawn_ps(0, 1).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coord = listener.local_addr().unwrap();
    drop(listener);

    let config = WorkerConfig {
        connect_retries: 1,
        connect_interval_ms: 10,
        ..worker_config(vec![ps], 3)
    };
    let mut worker = Worker::connect(&config).await.unwrap();

    let epochs = worker.run(coord, &mut OnesTrainer::default()).await.unwrap();
    assert_eq!(epochs, 0);

    worker.into_middleware().terminate().await.unwrap();
    ps_task.await.unwrap();
}
