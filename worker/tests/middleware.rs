use std::{
    collections::BTreeSet,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use comms::{
    DistMessage, DistMessageView, Handler, Reply, Retry,
    proto::{DenseTensor, Id, PullRequest, PushNotify, SparseRows, Tensor, TensorMap},
};
use tokio::{net::TcpListener, task::JoinHandle};
use worker::{Middleware, WorkerErr};

/// Answers pulls with rows holding its own index and records what is pushed to it.
#[derive(Default)]
struct FakeShard {
    index: usize,
    fail_saves: bool,
    pulled: Mutex<Vec<Id>>,
    pushed: Mutex<Vec<(String, usize)>>,
}

impl Handler for FakeShard {
    type Session = ();

    async fn on_message(&self, _: &mut (), msg: DistMessageView<'_>) -> io::Result<Reply> {
        match msg {
            DistMessageView::PullRequest(payload) => {
                let req: PullRequest = payload.decode()?;
                let mut params = TensorMap::new();

                for name in req.tsr_set {
                    params.insert(name, Tensor::Dense(DenseTensor::zeros(vec![2, 1]).unwrap()));
                }

                for (name, ids) in req.srm_map {
                    let mut srm = SparseRows::new(1);
                    for id in ids {
                        self.pulled.lock().unwrap().push(id);
                        srm.rows.insert(id, vec![self.index as f32]);
                    }
                    params.insert(name, Tensor::Sparse(srm));
                }

                Ok(Reply::Message(DistMessage::PullResponse(params)))
            }
            DistMessageView::PushNotify(payload) => {
                let push: PushNotify = payload.decode()?;
                let mut pushed = self.pushed.lock().unwrap();

                for (name, tensor) in push.grad {
                    let rows = match tensor {
                        Tensor::Dense(_) => 0,
                        Tensor::Sparse(srm) => srm.len(),
                    };
                    pushed.push((name, rows));
                }

                Ok(Reply::None)
            }
            DistMessageView::ModelSaveRequest { epoch, .. } => {
                Ok(Reply::Message(DistMessage::ModelSaveResponse {
                    saved: !self.fail_saves,
                    path: format!("model/epoch-{epoch}/shard-{}", self.index),
                }))
            }
            DistMessageView::TerminationNotify => Ok(Reply::Shutdown),
            msg => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected {:?}", msg.kind()),
            )),
        }
    }
}

struct Cluster {
    addrs: Vec<SocketAddr>,
    shards: Vec<Arc<FakeShard>>,
    tasks: Vec<JoinHandle<()>>,
}

async fn spawn_cluster(n: usize, fail_saves: bool) -> Cluster {
    let mut cluster = Cluster {
        addrs: Vec::new(),
        shards: Vec::new(),
        tasks: Vec::new(),
    };

    for index in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shard = Arc::new(FakeShard {
            index,
            fail_saves,
            ..Default::default()
        });

        cluster.addrs.push(listener.local_addr().unwrap());
        cluster.shards.push(Arc::clone(&shard));
        cluster
            .tasks
            .push(tokio::spawn(async move { comms::serve(&listener, shard).await.unwrap() }));
    }

    cluster
}

fn pull_request(dense: &[&str], ids: &[Id]) -> PullRequest {
    let mut req = PullRequest {
        is_train: true,
        ..Default::default()
    };
    req.tsr_set.extend(dense.iter().map(|name| name.to_string()));
    if !ids.is_empty() {
        req.srm_map.insert("emb".into(), ids.iter().copied().collect());
    }
    req
}

fn sparse_grad(name: &str, ids: &[Id]) -> PushNotify {
    let mut srm = SparseRows::new(1);
    srm.rows.extend(ids.iter().map(|&id| (id, vec![1.])));

    PushNotify {
        grad: TensorMap::from([(name.to_string(), Tensor::Sparse(srm))]),
        overwritten: TensorMap::new(),
    }
}

#[tokio::test]
async fn pull_reads_every_row_from_its_owner() {
    let cluster = spawn_cluster(2, false).await;
    let mut middleware = Middleware::connect(&cluster.addrs, Retry::default()).await.unwrap();

    let params = middleware.pull(&pull_request(&[], &[1, 2, 3, 4])).await.unwrap();

    let Tensor::Sparse(srm) = &params["emb"] else {
        panic!("expected sparse rows");
    };
    assert_eq!(srm.len(), 4);
    for (id, row) in &srm.rows {
        assert_eq!(row, &[(id % 2) as f32]);
    }

    let mut even = cluster.shards[0].pulled.lock().unwrap().clone();
    even.sort();
    assert_eq!(even, [2, 4]);

    middleware.terminate().await.unwrap();
    for task in cluster.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn shards_with_nothing_to_do_are_not_contacted() {
    let cluster = spawn_cluster(2, false).await;
    let mut middleware = Middleware::connect(&cluster.addrs, Retry::default()).await.unwrap();

    middleware.push(sparse_grad("emb", &[2, 4])).await.unwrap();
    middleware.pull(&pull_request(&[], &[6])).await.unwrap();

    assert_eq!(*cluster.shards[0].pushed.lock().unwrap(), [("emb".to_string(), 2)]);
    assert!(cluster.shards[1].pushed.lock().unwrap().is_empty());
    assert!(cluster.shards[1].pulled.lock().unwrap().is_empty());

    middleware.terminate().await.unwrap();
}

#[tokio::test]
async fn row_gradients_of_dense_tensors_go_whole_to_the_owner() {
    let cluster = spawn_cluster(2, false).await;
    let mut middleware = Middleware::connect(&cluster.addrs, Retry::default()).await.unwrap();

    middleware.pull(&pull_request(&["w"], &[])).await.unwrap();
    assert_eq!(middleware.dense(), &BTreeSet::from(["w".to_string()]));

    middleware.push(sparse_grad("w", &[0, 1])).await.unwrap();
    middleware.pull(&pull_request(&[], &[1, 2])).await.unwrap();

    let owner = middleware.shard_fn().tensor_shard("w");
    assert_eq!(*cluster.shards[owner].pushed.lock().unwrap(), [("w".to_string(), 2)]);
    assert!(cluster.shards[1 - owner].pushed.lock().unwrap().is_empty());

    middleware.terminate().await.unwrap();
}

#[tokio::test]
async fn save_model_collects_every_path() {
    let cluster = spawn_cluster(2, false).await;
    let mut middleware = Middleware::connect(&cluster.addrs, Retry::default()).await.unwrap();

    let paths = middleware.save_model(3, "").await.unwrap();
    assert_eq!(paths, ["model/epoch-3/shard-0", "model/epoch-3/shard-1"]);

    middleware.terminate().await.unwrap();
}

#[tokio::test]
async fn failed_saves_name_the_shard() {
    let cluster = spawn_cluster(1, true).await;
    let mut middleware = Middleware::connect(&cluster.addrs, Retry::default()).await.unwrap();

    let err = middleware.save_model(0, "").await.unwrap_err();
    assert!(matches!(err, WorkerErr::SaveFailed { peer } if peer == cluster.addrs[0]));

    middleware.terminate().await.unwrap();
}

#[tokio::test]
async fn no_endpoints_is_a_config_error() {
    let err = Middleware::connect(&[], Retry::default()).await.err().unwrap();
    assert!(matches!(err, WorkerErr::InvalidConfig(_)));
}
