use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tesseradb::config::Config;
use tesseradb::core::cell::{CellKey, decode_cell, encode_cell, encode_table_prefix};
use tesseradb::core::comm::{self, CommRegistry};
use tesseradb::core::commitlog::{CommitLogReader, CommitLogWriter};
use tesseradb::core::dfs::{Dfs, LocalDfs};
use tesseradb::core::hyperspace::LocalHyperspace;
use tesseradb::core::queue::ApplicationQueue;
use tesseradb::core::replication::fragment_worker::FragmentWorker;
use tesseradb::core::replication::slave::{ReplicationSlave, ReplicationSlaveService};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const LOCAL_CLUSTER: u64 = 1;
const FOREIGN_CLUSTER: u64 = 2;

fn block_payload(table_id: &str, rows: &[(&str, i64)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_table_prefix(&mut buf, &tesseradb::core::types::TableId::new(table_id, 1));
    for (row, revision) in rows {
        encode_cell(&mut buf, &CellKey::new(*row, *revision, false), b"value");
    }
    buf.to_vec()
}

/// Spins up a receiving slave with a live RPC endpoint and returns its
/// address plus the shared DFS it writes its sink logs to.
async fn spawn_receiving_slave(
    dir: &TempDir,
) -> (SocketAddr, Arc<dyn Dfs>, broadcast::Sender<()>) {
    let mut config = Config::default();
    config.data_dir = dir.path().join("remote-data").to_string_lossy().into_owned();
    config.toplevel_dir = "/remote".to_string();
    config.cluster.id = 7;
    config.commitlog.compress = false;
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("remote-dfs")));
    let hyperspace = Arc::new(LocalHyperspace::new());
    let registry = CommRegistry::new();
    let queue = ApplicationQueue::new(2);
    let slave = ReplicationSlave::new(config, dfs.clone(), hyperspace, registry, queue)
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(comm::serve(
        listener,
        Arc::new(ReplicationSlaveService(slave)),
        shutdown.subscribe(),
    ));
    (addr, dfs, shutdown)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_ships_local_blocks_and_filters_the_rest() {
    let dir = TempDir::new().unwrap();
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("dfs")));
    let (remote_addr, remote_dfs, _shutdown) = spawn_receiving_slave(&dir).await;

    // One fragment: a replicated local block, a foreign-origin block, and a
    // block of an unreplicated table.
    let writer = CommitLogWriter::open(dfs.clone(), "/src/log/user", LOCAL_CLUSTER, false)
        .await
        .unwrap();
    writer
        .write(&block_payload("t1", &[("a", 10), ("b", 11)]), 10)
        .await
        .unwrap();
    writer
        .write_with_cluster_id(&block_payload("t1", &[("x", 90)]), 90, FOREIGN_CLUSTER)
        .await
        .unwrap();
    writer
        .write(&block_payload("t2", &[("c", 20)]), 20)
        .await
        .unwrap();
    writer.close().await.unwrap();

    let registry = CommRegistry::new();
    let worker = FragmentWorker::new(
        dfs.clone(),
        registry,
        LOCAL_CLUSTER,
        HashMap::from([("t1".to_string(), vec!["backup".to_string()])]),
        HashMap::from([("t1".to_string(), "ns/t1".to_string())]),
        HashMap::from([("backup".to_string(), vec![remote_addr])]),
        3,
        Duration::from_secs(2),
    );
    let (original, intermediate, linked_logs) =
        worker.run("/src/log/user/0000000000".to_string()).await;
    assert!(original.error.is_none());
    assert!(intermediate.is_empty());
    assert!(linked_logs.is_empty());

    // Only the local t1 rows arrived, stamped with origin-cluster id 0 so
    // the receiving cluster never re-replicates them.
    let mut reader = CommitLogReader::open(remote_dfs, "/remote/replicated/ns/t1")
        .await
        .unwrap();
    let mut rows = Vec::new();
    while let Some(block) = reader.next().await.unwrap() {
        assert_eq!(block.header.cluster_id, 0);
        let mut payload = block.payload;
        while let Some((key, _)) = decode_cell(&mut payload).unwrap() {
            rows.push((key.row, key.revision));
        }
    }
    rows.sort();
    assert_eq!(rows, vec![("a".to_string(), 10), ("b".to_string(), 11)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_follows_linked_logs_before_finishing() {
    let dir = TempDir::new().unwrap();
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("dfs")));
    let (remote_addr, remote_dfs, _shutdown) = spawn_receiving_slave(&dir).await;

    // A transfer log linked from the main fragment.
    let transfer = CommitLogWriter::open(dfs.clone(), "/src/log/transfer-1", LOCAL_CLUSTER, false)
        .await
        .unwrap();
    transfer
        .write(&block_payload("t1", &[("linked", 33)]), 33)
        .await
        .unwrap();
    transfer.close().await.unwrap();

    let writer = CommitLogWriter::open(dfs.clone(), "/src/log/user", LOCAL_CLUSTER, false)
        .await
        .unwrap();
    writer
        .write(&block_payload("t1", &[("main", 30)]), 30)
        .await
        .unwrap();
    writer.link_log("/src/log/transfer-1", 31).await.unwrap();
    writer.close().await.unwrap();

    let registry = CommRegistry::new();
    let worker = FragmentWorker::new(
        dfs.clone(),
        registry,
        LOCAL_CLUSTER,
        HashMap::from([("t1".to_string(), vec!["backup".to_string()])]),
        HashMap::from([("t1".to_string(), "ns/t1".to_string())]),
        HashMap::from([("backup".to_string(), vec![remote_addr])]),
        3,
        Duration::from_secs(2),
    );
    let (original, intermediate, linked_logs) =
        worker.run("/src/log/user/0000000000".to_string()).await;

    assert!(original.error.is_none());
    // The linked fragment was processed as its own queue entry.
    assert_eq!(intermediate.len(), 1);
    assert!(intermediate[0].error.is_none());
    assert_eq!(linked_logs, vec!["/src/log/transfer-1".to_string()]);

    let mut reader = CommitLogReader::open(remote_dfs, "/remote/replicated/ns/t1")
        .await
        .unwrap();
    let mut rows = Vec::new();
    while let Some(block) = reader.next().await.unwrap() {
        let mut payload = block.payload;
        while let Some((key, _)) = decode_cell(&mut payload).unwrap() {
            rows.push(key.row);
        }
    }
    rows.sort();
    assert_eq!(rows, vec!["linked".to_string(), "main".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vanished_fragment_is_retried_under_its_purged_name() {
    let dir = TempDir::new().unwrap();
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("dfs")));
    let (remote_addr, remote_dfs, _shutdown) = spawn_receiving_slave(&dir).await;

    let writer = CommitLogWriter::open(dfs.clone(), "/src/log/user", LOCAL_CLUSTER, false)
        .await
        .unwrap();
    writer
        .write(&block_payload("t1", &[("purged-row", 44)]), 44)
        .await
        .unwrap();
    writer.close().await.unwrap();

    // The owner purged the fragment before the worker got to it.
    dfs.rename(
        "/src/log/user/0000000000",
        "/src/log/user/0000000000.purged",
    )
    .await
    .unwrap();

    let registry = CommRegistry::new();
    let worker = FragmentWorker::new(
        dfs.clone(),
        registry,
        LOCAL_CLUSTER,
        HashMap::from([("t1".to_string(), vec!["backup".to_string()])]),
        HashMap::from([("t1".to_string(), "ns/t1".to_string())]),
        HashMap::from([("backup".to_string(), vec![remote_addr])]),
        3,
        Duration::from_secs(2),
    );
    let (original, intermediate, _) = worker.run("/src/log/user/0000000000".to_string()).await;
    assert!(original.error.is_none());
    assert_eq!(intermediate.len(), 1);
    assert_eq!(
        intermediate[0].fragment,
        "/src/log/user/0000000000.purged".to_string()
    );
    assert!(intermediate[0].error.is_none());

    let mut reader = CommitLogReader::open(remote_dfs, "/remote/replicated/ns/t1")
        .await
        .unwrap();
    let block = reader.next().await.unwrap().unwrap();
    let mut payload = block.payload;
    let (key, _) = decode_cell(&mut payload).unwrap().unwrap();
    assert_eq!(key.row, "purged-row");
}
