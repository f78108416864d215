//! Concurrent mutations of one network from many tasks

mod common;

use common::{DatastoreSpec, Node};
use std::sync::Arc;
use std::time::Duration;
use testnet_harness::memory::OrchestratorCall;
use testnet_harness::{ArtifactResolver, Error, InMemoryOrchestrator, NetworkContext, Sha3ArtifactIdProvider};

fn shared_network() -> (tempfile::TempDir, Arc<InMemoryOrchestrator>, Arc<NetworkContext<Node>>) {
    let (dir, volume) = common::temp_volume();
    let engine = Arc::new(InMemoryOrchestrator::new());
    let network = Arc::new(NetworkContext::new(
        engine.clone(),
        volume,
        ArtifactResolver::new(Default::default(), &Sha3ArtifactIdProvider),
        false,
    ));
    (dir, engine, network)
}

fn add_service_calls(engine: &InMemoryOrchestrator) -> usize {
    engine
        .calls()
        .iter()
        .filter(|call| matches!(call, OrchestratorCall::AddService(_)))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_of_one_id_admit_exactly_one() {
    let (_dir, engine, network) = shared_network();

    let adds: Vec<_> = (0..16)
        .map(|_| {
            let network = Arc::clone(&network);
            tokio::spawn(async move {
                network
                    .add_service("x", &DatastoreSpec::new("x"))
                    .await
                    .map(|_| ())
            })
        })
        .collect();

    let mut succeeded = 0;
    for add in futures::future::join_all(adds).await {
        match add.unwrap() {
            Ok(()) => succeeded += 1,
            Err(Error::DuplicateServiceId(id)) => assert_eq!(id.as_str(), "x"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(network.size().await, 1);
    assert_eq!(add_service_calls(&engine), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_and_removes_stay_consistent() {
    let (_dir, engine, network) = shared_network();

    let adds: Vec<_> = (0..20)
        .map(|i| {
            let network = Arc::clone(&network);
            tokio::spawn(async move {
                let id = format!("svc-{i}");
                network.add_service(id.as_str(), &DatastoreSpec::new(&id)).await?;
                if i % 2 == 0 {
                    network.remove_service(&id.into(), Duration::from_secs(1)).await?;
                }
                Ok::<_, Error>(())
            })
        })
        .collect();

    for add in futures::future::join_all(adds).await {
        add.unwrap().unwrap();
    }

    assert_eq!(network.size().await, 10);
    assert_eq!(engine.running_services().len(), 10);
    assert_eq!(add_service_calls(&engine), 20);
}
