use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use tesseradb::config::Config;
use tesseradb::core::TesseraError;
use tesseradb::core::comm::CommRegistry;
use tesseradb::core::dfs::{Dfs, LocalDfs};
use tesseradb::core::hyperspace::LocalHyperspace;
use tesseradb::core::metalog::SchemaUpdateKind;
use tesseradb::core::notification::{RecordingNotificationHook, Severity};
use tesseradb::core::protocol::WireError;
use tesseradb::core::replication::TableSchema;
use tesseradb::core::replication::master::ReplicationMaster;
use tesseradb::core::types::Location;

async fn test_master(
    dir: &TempDir,
) -> (
    Arc<ReplicationMaster>,
    Arc<dyn Dfs>,
    Arc<RecordingNotificationHook>,
) {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data").to_string_lossy().into_owned();
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("dfs")));
    let hyperspace = Arc::new(LocalHyperspace::new());
    let registry = CommRegistry::new();
    let notifier = RecordingNotificationHook::new();
    let master = ReplicationMaster::new(config, dfs.clone(), hyperspace, registry, notifier.clone())
        .await
        .unwrap();
    (master, dfs, notifier)
}

fn schema_json(id: &str, name: &str, clusters: &[&str]) -> String {
    TableSchema {
        name: name.to_string(),
        id: id.to_string(),
        generation: 1,
        replication_clusters: clusters.iter().map(|s| s.to_string()).collect(),
        column_families: vec!["cf1".to_string()],
    }
    .to_json()
    .unwrap()
}

async fn enable_replication(master: &Arc<ReplicationMaster>) {
    // The push to the (unconfigured) remote master fails, but the local
    // routing tables are updated first.
    let result = master
        .handle_schema_update(
            SchemaUpdateKind::CreateTable,
            "t1",
            "ns/t1",
            &schema_json("t1", "ns/t1", &["backup"]),
        )
        .await;
    assert!(matches!(
        result,
        Err(TesseraError::ReplicationClusterNotFound(_))
    ));
    master.update_receivers("backup", vec!["127.0.0.1:9999".to_string()]);
}

fn slave_addr(port: u16) -> std::net::SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[tokio::test]
async fn scan_classifies_fragments_exactly_once() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, _) = test_master(&dir).await;
    enable_replication(&master).await;

    let path = "/tessera/servers/rs-9/log/user/0000000042";
    dfs.append(path, Bytes::from_static(b"data")).await.unwrap();
    dfs.append(
        "/tessera/servers/rs-9/log/user/0000000042.mark",
        Bytes::from_static(b"m"),
    )
    .await
    .unwrap();

    master.scan_dfs().await.unwrap();
    let (unassigned, assigned, finished) = master.fragment_sets();
    assert!(unassigned.contains(path));
    assert!(assigned.is_empty() && finished.is_empty());

    // Assignment moves it to exactly one slave.
    let slave = Location::new("rs-slave1");
    let (fragments, _, _, _) = master.assign_fragments(&slave, slave_addr(40001));
    assert_eq!(fragments, vec![path.to_string()]);
    let (unassigned, assigned, finished) = master.fragment_sets();
    assert!(unassigned.is_empty() && finished.is_empty());
    assert_eq!(assigned.get(path), Some(&slave));

    // A rescan never steals an assigned fragment.
    master.scan_dfs().await.unwrap();
    let (unassigned, assigned, _) = master.fragment_sets();
    assert!(unassigned.is_empty());
    assert_eq!(assigned.len(), 1);

    // Completion moves it to finished.
    master
        .finished_fragment(path, None, 0, vec![])
        .await
        .unwrap();
    let (unassigned, assigned, finished) = master.fragment_sets();
    assert!(unassigned.is_empty() && assigned.is_empty());
    assert!(finished.contains(path));
}

#[tokio::test]
async fn purged_finished_fragment_is_physically_deleted() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, _) = test_master(&dir).await;
    enable_replication(&master).await;

    let path = "/tessera/servers/rs-1/log/user/0000000042";
    dfs.append(path, Bytes::from_static(b"data")).await.unwrap();
    master.scan_dfs().await.unwrap();
    let slave = Location::new("rs-slave1");
    let (fragments, _, _, _) = master.assign_fragments(&slave, slave_addr(40001));
    assert_eq!(fragments.len(), 1);
    master
        .finished_fragment(path, None, 0, vec![])
        .await
        .unwrap();

    // The owning range server purges the shipped fragment.
    dfs.rename(path, &format!("{path}.purged")).await.unwrap();

    master.scan_dfs().await.unwrap();
    assert!(!dfs.exists(&format!("{path}.purged")).await.unwrap());
    assert!(dfs.exists(&format!("{path}.deleted")).await.unwrap());
    let (unassigned, assigned, finished) = master.fragment_sets();
    assert!(unassigned.is_empty() && assigned.is_empty() && finished.is_empty());
}

#[tokio::test]
async fn dead_slave_assignments_return_to_the_pool() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, _) = test_master(&dir).await;
    enable_replication(&master).await;

    for id in [1u32, 2] {
        dfs.append(
            &format!("/tessera/servers/rs-1/log/user/{id:010}"),
            Bytes::from_static(b"data"),
        )
        .await
        .unwrap();
    }
    master.scan_dfs().await.unwrap();

    let s1 = Location::new("rs-slave1");
    let (fragments, _, _, _) = master.assign_fragments(&s1, slave_addr(40001));
    assert_eq!(fragments.len(), 2);

    master.handle_slave_disconnect(&s1).await;
    let (unassigned, assigned, _) = master.fragment_sets();
    assert_eq!(unassigned.len(), 2);
    assert!(assigned.is_empty());

    let s2 = Location::new("rs-slave2");
    let (fragments, _, _, _) = master.assign_fragments(&s2, slave_addr(40002));
    assert_eq!(fragments.len(), 2);
}

#[tokio::test]
async fn assignment_quota_spreads_over_known_slaves() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, _) = test_master(&dir).await;
    enable_replication(&master).await;

    // Register both slaves while the pool is still empty.
    let s1 = Location::new("rs-slave1");
    let s2 = Location::new("rs-slave2");
    master.assign_fragments(&s1, slave_addr(40001));
    master.assign_fragments(&s2, slave_addr(40002));

    for id in 0..4u32 {
        dfs.append(
            &format!("/tessera/servers/rs-1/log/user/{id:010}"),
            Bytes::from_static(b"data"),
        )
        .await
        .unwrap();
    }
    master.scan_dfs().await.unwrap();

    // The per-call quota is ceil(unassigned / known_slaves).
    let (a, _, _, _) = master.assign_fragments(&s1, slave_addr(40001));
    assert_eq!(a.len(), 2);
    let (b, _, _, _) = master.assign_fragments(&s2, slave_addr(40002));
    assert_eq!(b.len(), 1);
    let (c, _, _, _) = master.assign_fragments(&s1, slave_addr(40001));
    assert_eq!(c.len(), 1);
    let (unassigned, assigned, _) = master.fragment_sets();
    assert!(unassigned.is_empty());
    assert_eq!(assigned.len(), 4);
}

#[tokio::test]
async fn no_assignment_without_replicated_tables() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, _) = test_master(&dir).await;
    // Receivers exist, but no table requests replication.
    master.update_receivers("backup", vec!["127.0.0.1:9999".to_string()]);

    dfs.append(
        "/tessera/servers/rs-1/log/user/0000000001",
        Bytes::from_static(b"data"),
    )
    .await
    .unwrap();
    master.scan_dfs().await.unwrap();

    let (fragments, clusters, _, _) = master
        .assign_fragments(&Location::new("rs-slave1"), slave_addr(40001));
    assert!(fragments.is_empty());
    // The cluster map is still returned for in-flight workers.
    assert_eq!(clusters.len(), 1);
}

#[tokio::test]
async fn failed_fragment_is_quarantined_and_reported() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, notifier) = test_master(&dir).await;
    enable_replication(&master).await;

    let path = "/tessera/servers/rs-1/log/user/0000000007";
    dfs.append(path, Bytes::from_static(b"data")).await.unwrap();
    master.scan_dfs().await.unwrap();
    master.assign_fragments(&Location::new("rs-slave1"), slave_addr(40001));

    master
        .finished_fragment(
            path,
            Some(WireError::CorruptCommitLog("bad checksum".into())),
            0,
            vec![],
        )
        .await
        .unwrap();

    // Gone from all three sets, file moved aside, administrator notified.
    let (unassigned, assigned, finished) = master.fragment_sets();
    assert!(unassigned.is_empty() && assigned.is_empty() && finished.is_empty());
    assert!(!dfs.exists(path).await.unwrap());
    let notifications = notifier.notifications.lock();
    assert!(
        notifications
            .iter()
            .any(|(severity, _)| *severity == Severity::Error)
    );
}

#[tokio::test]
async fn linked_logs_are_scanned_on_later_rounds() {
    let dir = TempDir::new().unwrap();
    let (master, dfs, _) = test_master(&dir).await;
    enable_replication(&master).await;

    let path = "/tessera/servers/rs-1/log/user/0000000001";
    dfs.append(path, Bytes::from_static(b"data")).await.unwrap();
    master.scan_dfs().await.unwrap();
    master.assign_fragments(&Location::new("rs-slave1"), slave_addr(40001));

    let transfer_dir = "/tessera/servers/rs-1/log/phantom/t1/abc-0";
    dfs.append(
        &format!("{transfer_dir}/0000000000"),
        Bytes::from_static(b"linked"),
    )
    .await
    .unwrap();

    master
        .finished_fragment(path, None, 0, vec![transfer_dir.to_string()])
        .await
        .unwrap();
    master.scan_dfs().await.unwrap();

    let (unassigned, _, _) = master.fragment_sets();
    assert!(unassigned.contains(&format!("{transfer_dir}/0000000000")));
}

#[tokio::test]
async fn schema_updates_are_generation_fenced() {
    let dir = TempDir::new().unwrap();
    let (master, _, _) = test_master(&dir).await;

    let mut schema = TableSchema::from_json(&schema_json("t1", "ns/t1", &["source"])).unwrap();
    schema.generation = 5;
    master
        .apply_schema_update(
            SchemaUpdateKind::CreateTable,
            "ns/t1",
            &schema.to_json().unwrap(),
        )
        .await
        .unwrap();

    // An older (or equal) generation is dropped silently.
    schema.generation = 4;
    master
        .apply_schema_update(
            SchemaUpdateKind::AlterTable,
            "ns/t1",
            &schema.to_json().unwrap(),
        )
        .await
        .unwrap();

    schema.generation = 6;
    master
        .apply_schema_update(
            SchemaUpdateKind::AlterTable,
            "ns/t1",
            &schema.to_json().unwrap(),
        )
        .await
        .unwrap();
}
