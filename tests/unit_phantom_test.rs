use bytes::BytesMut;
use std::sync::Arc;
use tempfile::TempDir;
use tesseradb::config::Config;
use tesseradb::core::TesseraError;
use tesseradb::core::cell::{CellKey, decode_cell, decode_table_prefix, encode_cell};
use tesseradb::core::comm::CommRegistry;
use tesseradb::core::commitlog::CommitLogReader;
use tesseradb::core::dfs::{Dfs, LocalDfs};
use tesseradb::core::hyperspace::LocalHyperspace;
use tesseradb::core::protocol::{RpcResponse, WireError};
use tesseradb::core::queue::ApplicationQueue;
use tesseradb::core::rangeserver::RangeServer;
use tesseradb::core::types::{Location, QualifiedRange, RangeSpec, RangeState, TableId};

async fn test_server(dir: &TempDir) -> (Arc<RangeServer>, Arc<dyn Dfs>) {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data").to_string_lossy().into_owned();
    config.master_addr = "127.0.0.1:1".to_string();
    config.commitlog.compress = false;
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("dfs")));
    let hyperspace = Arc::new(LocalHyperspace::new());
    let registry = CommRegistry::new();
    let queue = ApplicationQueue::new(2);
    let server = RangeServer::new(
        config,
        Location::new("rs-2"),
        dfs.clone(),
        hyperspace,
        registry,
        queue,
    )
    .await
    .unwrap();
    (server, dfs)
}

fn range_am() -> QualifiedRange {
    QualifiedRange::new(TableId::new("u1", 1), RangeSpec::new("a", "m"))
}

fn source() -> Location {
    Location::new("rs-1")
}

fn cells_payload(rows: &[(&str, i64)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for (row, revision) in rows {
        encode_cell(&mut buf, &CellKey::new(*row, *revision, false), b"value");
    }
    buf.to_vec()
}

async fn load(server: &Arc<RangeServer>, plan_generation: u32) -> Result<RpcResponse, TesseraError> {
    server
        .handle_phantom_load(
            source(),
            plan_generation,
            vec![0],
            vec![range_am()],
            vec![RangeState::steady()],
        )
        .await
}

#[tokio::test]
async fn phantom_load_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (server, _dfs) = test_server(&dir).await;

    assert!(matches!(load(&server, 7).await.unwrap(), RpcResponse::Ok));
    // The same load again succeeds without creating a second phantom range.
    assert!(matches!(load(&server, 7).await.unwrap(), RpcResponse::Ok));

    // An update for the single phantom range still lands.
    server
        .handle_phantom_update(source(), 7, range_am(), 0, cells_payload(&[("b", 1)]))
        .await
        .unwrap();
}

#[tokio::test]
async fn phantom_load_generation_rules() {
    let dir = TempDir::new().unwrap();
    let (server, _dfs) = test_server(&dir).await;

    load(&server, 7).await.unwrap();

    // Stale loads are refused.
    assert!(matches!(
        load(&server, 6).await,
        Err(TesseraError::PlanGenerationMismatch {
            supplied: 6,
            installed: 7
        })
    ));

    // A newer generation discards and recreates the map; updates for the old
    // generation are then refused.
    load(&server, 8).await.unwrap();
    assert!(matches!(
        server
            .handle_phantom_update(source(), 7, range_am(), 0, cells_payload(&[("b", 1)]))
            .await,
        Err(TesseraError::PlanGenerationMismatch { .. })
    ));
}

#[tokio::test]
async fn phantom_update_without_map_is_an_error() {
    let dir = TempDir::new().unwrap();
    let (server, _dfs) = test_server(&dir).await;

    assert!(matches!(
        server
            .handle_phantom_update(source(), 1, range_am(), 0, cells_payload(&[("b", 1)]))
            .await,
        Err(TesseraError::PhantomRangeMapNotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_fragment_batch_is_reported() {
    let dir = TempDir::new().unwrap();
    let (server, _dfs) = test_server(&dir).await;

    load(&server, 7).await.unwrap();
    server
        .handle_phantom_update(source(), 7, range_am(), 0, cells_payload(&[("b", 1)]))
        .await
        .unwrap();
    assert!(matches!(
        server
            .handle_phantom_update(source(), 7, range_am(), 0, cells_payload(&[("b", 2)]))
            .await,
        Err(TesseraError::FragmentAlreadyProcessed(_))
    ));
}

#[tokio::test]
async fn prepare_commit_acknowledge_flips_range_live() {
    let dir = TempDir::new().unwrap();
    let (server, dfs) = test_server(&dir).await;

    load(&server, 7).await.unwrap();
    server
        .handle_phantom_update(
            source(),
            7,
            range_am(),
            0,
            cells_payload(&[("b", 10), ("c", 11), ("z", 12)]),
        )
        .await
        .unwrap();

    server
        .phantom_prepare_ranges(&source(), vec![range_am()])
        .await
        .unwrap();
    // Prepare is idempotent.
    server
        .phantom_prepare_ranges(&source(), vec![range_am()])
        .await
        .unwrap();
    assert!(!server.is_live(&range_am()));

    server
        .phantom_commit_ranges(&source(), vec![range_am()])
        .await
        .unwrap();
    assert!(server.is_live(&range_am()));
    // Commit is idempotent (the map is gone, the ranges are live).
    server
        .phantom_commit_ranges(&source(), vec![range_am()])
        .await
        .unwrap();

    // The METADATA row records the new owner.
    let mut reader = CommitLogReader::open(dfs.clone(), "/tessera/servers/rs-2/log/metadata")
        .await
        .unwrap();
    let mut found_location = false;
    while let Some(block) = reader.next().await.unwrap() {
        let mut payload = block.payload;
        let table = decode_table_prefix(&mut payload).unwrap();
        assert!(table.is_metadata());
        while let Some((key, value)) = decode_cell(&mut payload).unwrap() {
            if key.row == "u1:m" {
                assert_eq!(&value[..], b"rs-2");
                found_location = true;
            }
        }
    }
    assert!(found_location);

    // The replayed in-range cells are reachable through the user log (the
    // phantom log was linked in); the out-of-range row "z" was filtered.
    let mut reader = CommitLogReader::open(dfs.clone(), "/tessera/servers/rs-2/log/user")
        .await
        .unwrap();
    let mut rows = Vec::new();
    while let Some(block) = reader.next().await.unwrap() {
        let mut payload = block.payload;
        decode_table_prefix(&mut payload).unwrap();
        while let Some((key, _)) = decode_cell(&mut payload).unwrap() {
            rows.push(key.row);
        }
    }
    assert!(rows.contains(&"b".to_string()));
    assert!(rows.contains(&"c".to_string()));
    assert!(!rows.contains(&"z".to_string()));

    // Acknowledge marks the range and reports per-range success.
    match server
        .handle_acknowledge_load(vec![range_am()])
        .await
        .unwrap()
    {
        RpcResponse::AcknowledgeLoad { results } => {
            assert_eq!(results.len(), 1);
            assert!(results[0].1.is_none());
        }
        other => panic!("unexpected response {other:?}"),
    }

    // A later phantom_load for the now-live range is refused.
    assert!(matches!(
        load(&server, 9).await,
        Err(TesseraError::RangesAlreadyLive(_))
    ));
}

#[tokio::test]
async fn acknowledge_unknown_range_reports_error() {
    let dir = TempDir::new().unwrap();
    let (server, _dfs) = test_server(&dir).await;

    match server
        .handle_acknowledge_load(vec![range_am()])
        .await
        .unwrap()
    {
        RpcResponse::AcknowledgeLoad { results } => {
            assert!(matches!(results[0].1, Some(WireError::RangeNotFound(_))));
        }
        other => panic!("unexpected response {other:?}"),
    }
}
