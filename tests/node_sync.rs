//! Replication scenarios between a corp node and its stores through the
//! public node API.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use symmetric_sync::{engine_builder, find_identity, AppConfig, JobRunner, JobSchedule};
use symmetric_sync_engine::{
    DirectoryTransport, LoopbackNetwork, MemoryDatabase, SyncEndpoint, SyncEngine, TransformSet,
};
use sync_core::{
    AckStatus, BatchAck, ConfigStore, Data, DataEventType, DataStore, MemoryStore,
    OutgoingBatchStatus, OutgoingBatchStore, Topology,
};

const TOPOLOGY: &str = r#"
nodes:
  - { node_id: corp-000, node_group_id: corp, external_id: "000" }
  - { node_id: store-001, node_group_id: store, external_id: "001" }
  - { node_id: store-002, node_group_id: store, external_id: "002" }
node_group_links:
  - { source_node_group_id: corp, target_node_group_id: store, data_event_action: P }
trigger_routers:
  - trigger: { trigger_id: item, source_table_name: item }
    router: { router_id: corp_2_store, source_node_group_id: corp, target_node_group_id: store }
trigger_histories:
  - trigger_hist_id: 1
    trigger_id: item
    source_table_name: item
    column_names: [id, name]
    pk_column_names: [id]
"#;

struct TestNode {
    store: MemoryStore,
    database: Arc<MemoryDatabase>,
    engine: Arc<SyncEngine>,
}

async fn node(node_id: &str, staging: &std::path::Path) -> TestNode {
    let store = MemoryStore::new();
    Topology::from_yaml(TOPOLOGY).unwrap().seed(&store).await.unwrap();
    let identity = find_identity(&store, node_id).await.unwrap();
    let database = Arc::new(MemoryDatabase::new());
    let engine = engine_builder(
        Arc::new(store.clone()),
        identity,
        &AppConfig::default(),
        database.clone(),
        &staging.join(node_id),
        TransformSet::default(),
    )
    .build()
    .unwrap();
    engine.start().await.unwrap();
    TestNode {
        store,
        database,
        engine: Arc::new(engine),
    }
}

async fn capture_inserts(store: &MemoryStore, names: &[&str]) -> Vec<i64> {
    let mut ids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let data = Data::new("item", DataEventType::Insert, 1, "default")
            .with_row_data(vec![Some((i + 1).to_string()), Some(name.to_string())]);
        ids.push(store.insert_data(&data).await.unwrap());
    }
    ids
}

/// Store endpoint that notes the sender's batch statuses for the store
/// while a push is in flight.
struct InFlight {
    target: String,
    origin: MemoryStore,
    engine: Arc<SyncEngine>,
    seen: Mutex<Vec<OutgoingBatchStatus>>,
}

impl InFlight {
    fn new(target: &str, origin: &MemoryStore, engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            target: target.to_string(),
            origin: origin.clone(),
            engine,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SyncEndpoint for InFlight {
    async fn handle_pull(&self, node_id: &str) -> Result<Vec<u8>> {
        self.engine.handle_pull(node_id).await
    }

    async fn handle_push(&self, node_id: &str, payload: &[u8]) -> Result<Vec<BatchAck>> {
        let statuses = self
            .origin
            .outgoing_batches()
            .await
            .into_iter()
            .filter(|b| b.node_id == self.target)
            .map(|b| b.status);
        self.seen.lock().await.extend(statuses);
        self.engine.handle_push(node_id, payload).await
    }

    async fn handle_acks(&self, acks: &[BatchAck]) -> Result<()> {
        self.engine.handle_acks(acks).await
    }
}

async fn batches_with(store: &MemoryStore, status: OutgoingBatchStatus) -> usize {
    store
        .select_outgoing_batches_by_status(&[status])
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_push_to_two_stores_reaches_ok() {
    let staging = tempfile::tempdir().unwrap();
    let corp = node("corp-000", staging.path()).await;
    let first = node("store-001", staging.path()).await;
    let second = node("store-002", staging.path()).await;
    let ids = capture_inserts(&corp.store, &["apple", "pear", "plum"]).await;

    assert_eq!(corp.engine.route().await.unwrap(), Some(3));
    let routed = corp.store.outgoing_batches().await;
    assert_eq!(routed.len(), 2);
    assert_eq!(
        routed.iter().map(|b| b.node_id.as_str()).collect::<Vec<_>>(),
        vec!["store-001", "store-002"]
    );
    for batch in &routed {
        assert_eq!(batch.status, OutgoingBatchStatus::New);
        assert_eq!(
            corp.store.select_data_ids_for_batch(batch.batch_id).await.unwrap(),
            ids
        );
    }
    assert_eq!(corp.engine.status().await.unwrap().get("NE"), Some(&2));

    let network = LoopbackNetwork::new();
    let to_first = InFlight::new("store-001", &corp.store, first.engine.clone());
    let to_second = InFlight::new("store-002", &corp.store, second.engine.clone());
    network.register("store-001", to_first.clone()).await;
    network.register("store-002", to_second.clone()).await;
    let transport = network.transport("corp-000");
    assert_eq!(corp.engine.push_to_all(&transport).await.unwrap(), 2);

    assert_eq!(*to_first.seen.lock().await, vec![OutgoingBatchStatus::Sending]);
    assert_eq!(*to_second.seen.lock().await, vec![OutgoingBatchStatus::Sending]);
    for target in [&first, &second] {
        let rows = target.database.rows("item").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"].as_deref(), Some("apple"));
        assert_eq!(target.store.incoming_batches().await.len(), 1);
    }
    assert!(corp
        .store
        .outgoing_batches()
        .await
        .iter()
        .all(|b| b.status == OutgoingBatchStatus::Ok));
    assert!(corp.engine.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redelivered_payload_is_not_applied_twice() {
    let staging = tempfile::tempdir().unwrap();
    let corp = node("corp-000", staging.path()).await;
    let store = node("store-001", staging.path()).await;
    capture_inserts(&corp.store, &["apple", "pear", "plum"]).await;
    corp.engine.route().await.unwrap();

    let payload = corp.engine.extract_for("store-001").await.unwrap();
    let first = store.engine.load("corp-000", &payload).await.unwrap();
    let statements = store.database.statements().await.len();
    let second = store.engine.load("corp-000", &payload).await.unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.iter().all(|ack| ack.status == AckStatus::Ok));
    assert_eq!(store.database.statements().await.len(), statements);
    assert_eq!(store.database.row_count("item").await, 3);
}

#[tokio::test]
async fn test_jobs_over_directory_transport() {
    let staging = tempfile::tempdir().unwrap();
    let shared = tempfile::tempdir().unwrap();
    let corp = node("corp-000", staging.path()).await;
    let store = node("store-001", staging.path()).await;
    capture_inserts(&corp.store, &["apple", "pear"]).await;

    let corp_jobs = JobRunner::new(
        corp.engine.clone(),
        Arc::new(DirectoryTransport::new(shared.path(), "corp-000")),
        JobSchedule::default(),
    );
    let store_jobs = JobRunner::new(
        store.engine.clone(),
        Arc::new(DirectoryTransport::new(shared.path(), "store-001")),
        JobSchedule::default(),
    );

    assert_eq!(corp_jobs.route().await.unwrap(), 2);
    assert_eq!(corp_jobs.push().await.unwrap(), 2);
    // Nothing is acknowledged until the target loads the file.
    assert_eq!(corp_jobs.ack().await.unwrap(), 0);

    assert_eq!(store_jobs.pull().await.unwrap(), 1);
    assert_eq!(store.database.row_count("item").await, 2);
    assert_eq!(store_jobs.pull().await.unwrap(), 0);

    assert_eq!(corp_jobs.ack().await.unwrap(), 1);
    assert_eq!(batches_with(&corp.store, OutgoingBatchStatus::Ok).await, 1);
    // store-002 has not picked up its file yet.
    assert_eq!(batches_with(&corp.store, OutgoingBatchStatus::Loading).await, 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let staging = tempfile::tempdir().unwrap();
    let shared = tempfile::tempdir().unwrap();
    let corp = node("corp-000", staging.path()).await;
    let jobs = JobRunner::new(
        corp.engine.clone(),
        Arc::new(DirectoryTransport::new(shared.path(), "corp-000")),
        JobSchedule::default(),
    );
    tokio::time::timeout(std::time::Duration::from_secs(5), jobs.run(async {}))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unknown_identity() {
    let store = MemoryStore::new();
    Topology::from_yaml(TOPOLOGY).unwrap().seed(&store).await.unwrap();
    let err = tokio_test::assert_err!(find_identity(&store, "store-999").await);
    assert!(err.to_string().contains("store-999"));
    assert_eq!(store.nodes().await.unwrap().len(), 3);
}
