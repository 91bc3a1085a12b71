use std::{env, num::NonZeroUsize, process, sync::Arc, time::Duration};

use comms::{
    Connection, DistMessage,
    proto::{Id, PullRequest, PushNotify, SparseRows, Tensor, TensorMap},
};
use parameter_server::{
    ModelShard, ParamServer, ServerConfig, ShardHandle,
    initialization::Initializer,
    storage::{Graph, ParamDecl},
};
use tokio::{net::TcpListener, task::JoinHandle, time};

fn config() -> ServerConfig {
    ServerConfig {
        graph: Graph::new(vec![
            ParamDecl::dense("bias", vec![1], Initializer::Zeros),
            ParamDecl::sparse("emb", 2, Initializer::Constant { value: 0.5 }),
        ]),
        optimizer: "SGDOptimizer".to_string(),
        optimizer_config: "alpha=0.5;batch_decay=0".to_string(),
        lock_shards: NonZeroUsize::new(2).unwrap(),
        freq_filter_threshold: 2,
        ..Default::default()
    }
}

async fn spawn_server(config: ServerConfig) -> (Connection, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shard = ShardHandle::new(ModelShard::build(&config).unwrap());
    let server = Arc::new(ParamServer::new(shard, config.out_model));
    let task = tokio::spawn(async move { comms::serve(&listener, server).await.unwrap() });

    (Connection::connect(addr).await.unwrap(), task)
}

fn pull(ids: &[Id], freqs: &[(Id, u32)]) -> DistMessage {
    let mut req = PullRequest {
        is_train: true,
        ..Default::default()
    };
    req.tsr_set.insert("bias".into());
    req.srm_map.insert("emb".into(), ids.iter().copied().collect());
    req.id_freq_map.extend(freqs.iter().copied());
    DistMessage::PullRequest(req)
}

async fn pull_rows(conn: &mut Connection, ids: &[Id], freqs: &[(Id, u32)]) -> SparseRows {
    let Some(DistMessage::PullResponse(mut map)) = conn.rpc(&pull(ids, freqs)).await.unwrap() else {
        panic!("expected a pull response");
    };

    assert!(map.contains_key("bias"));
    match map.remove("emb") {
        Some(Tensor::Sparse(srm)) => srm,
        other => panic!("expected sparse rows, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_push_pull() {
    let (mut conn, server) = spawn_server(config()).await;

    let rows = pull_rows(&mut conn, &[1, 2, 3], &[(1, 5), (2, 1), (3, 2)]).await;
    let mut ids: Vec<_> = rows.rows.keys().copied().collect();
    ids.sort();
    assert_eq!(ids, [1, 3]);
    assert_eq!(rows.rows[&1], [0.5, 0.5]);

    let mut grad = SparseRows::new(2);
    grad.rows.insert(1, vec![1., -1.]);
    grad.rows.insert(2, vec![1., 1.]);
    let push = PushNotify {
        grad: TensorMap::from([("emb".to_string(), Tensor::Sparse(grad))]),
        overwritten: TensorMap::new(),
    };
    assert_eq!(conn.rpc(&DistMessage::PushNotify(push)).await.unwrap(), None);

    let rows = pull_rows(&mut conn, &[1, 2], &[]).await;
    assert_eq!(rows.rows[&1], [0., 1.]);
    assert!(!rows.rows.contains_key(&2));

    assert_eq!(
        conn.rpc(&DistMessage::EchoRequest).await.unwrap(),
        Some(DistMessage::EchoResponse)
    );

    conn.send(&DistMessage::TerminationNotify).await.unwrap();
    time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn save_request_writes_a_checkpoint() {
    let out = env::temp_dir().join(format!("param-server-save-{}", process::id()));
    let config = ServerConfig {
        out_model: out.clone(),
        ..config()
    };
    let (mut conn, server) = spawn_server(config).await;

    let save = DistMessage::ModelSaveRequest {
        epoch: 3,
        timestamp: "final".to_string(),
    };
    let Some(DistMessage::ModelSaveResponse { saved, path }) = conn.rpc(&save).await.unwrap() else {
        panic!("expected a save response");
    };

    assert!(saved);
    assert_eq!(path, out.join("epoch-3-final").display().to_string());
    assert!(out.join("epoch-3-final").join("SUCCESS.0").exists());

    conn.send(&DistMessage::TerminationNotify).await.unwrap();
    time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    std::fs::remove_dir_all(out).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_messages_drop_the_connection() {
    let (mut conn, server) = spawn_server(config()).await;

    conn.send(&DistMessage::FileRequest).await.unwrap();
    assert!(conn.recv().await.is_err());

    let addr = conn.peer();
    let mut other = Connection::connect(addr).await.unwrap();
    other.send(&DistMessage::TerminationNotify).await.unwrap();
    time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
