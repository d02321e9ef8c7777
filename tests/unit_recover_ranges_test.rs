use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tesseradb::config::Config;
use tesseradb::core::balance::BalancePlanAuthority;
use tesseradb::core::comm::{CommRegistry, RangeServerClient};
use tesseradb::core::dfs::{Dfs, LocalDfs};
use tesseradb::core::hyperspace::{Hyperspace, LocalHyperspace, try_lock_exclusive};
use tesseradb::core::master::MasterContext;
use tesseradb::core::master::connection_manager::RangeServerConnectionManager;
use tesseradb::core::master::recover_ranges::OperationRecoverRanges;
use tesseradb::core::master::recover_server::OperationRecover;
use tesseradb::core::master::recovery_state::{RecoveryState, ReplayCounter, StepFuture};
use tesseradb::core::metalog::{MetalogWriter, RecoverRangesState};
use tesseradb::core::notification::RecordingNotificationHook;
use tesseradb::core::protocol::WireError;
use tesseradb::core::types::{
    Location, QualifiedRange, RangeMoveSpec, RangeSpec, RangeState, RangeType, TableId,
};

async fn test_context(dir: &TempDir, servers: &[&str]) -> Arc<MasterContext> {
    let mut config = Config::default();
    config.data_dir = dir.path().join("data").to_string_lossy().into_owned();
    config.failover.timeout = Duration::from_millis(300);
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path().join("dfs")));
    let hyperspace: Arc<dyn Hyperspace> = Arc::new(LocalHyperspace::new());
    let session = hyperspace.create_session();
    let rsc_manager = Arc::new(RangeServerConnectionManager::new());
    for (i, name) in servers.iter().enumerate() {
        rsc_manager.connect_server(
            Location::new(*name),
            "127.0.0.1".to_string(),
            // Nothing listens here; sends are expected to fail fast.
            format!("127.0.0.1:{}", 1 + i).parse().unwrap(),
        );
    }
    let (mml_writer, _) = MetalogWriter::open(dfs.clone(), "/tessera/master/mml")
        .await
        .unwrap();
    let mml_writer = Arc::new(mml_writer);
    let registry = CommRegistry::new();
    let bpa = BalancePlanAuthority::new(
        dfs.clone(),
        "/tessera",
        rsc_manager.clone(),
        mml_writer.clone(),
        None,
    )
    .await
    .unwrap();
    let rs_client = RangeServerClient::new(
        registry.clone(),
        rsc_manager.clone(),
        Duration::from_millis(300),
    );
    Arc::new(MasterContext {
        config,
        dfs,
        hyperspace,
        hyperspace_session: session,
        mml_writer,
        bpa,
        rsc_manager,
        recovery_state: RecoveryState::new(),
        rs_client,
        notifier: RecordingNotificationHook::new(),
    })
}

fn user_range(end: &str) -> QualifiedRange {
    QualifiedRange::new(TableId::new("u1", 1), RangeSpec::new("", end))
}

#[tokio::test]
async fn replay_counter_tracks_destinations_and_attempts() {
    let counter = ReplayCounter::new(2);
    counter.add(2);

    // A completion for an abandoned attempt is discarded.
    counter.complete(1, vec![], true);
    counter.complete(2, vec![], true);

    let counter_clone = counter.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        counter_clone.complete(2, vec![], true);
    });
    assert!(counter.wait_for_completion(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn replay_counter_times_out_and_reports_failure() {
    let counter = ReplayCounter::new(1);
    counter.add(1);
    assert!(!counter.wait_for_completion(Duration::from_millis(100)).await);

    let counter = ReplayCounter::new(1);
    counter.add(2);
    counter.set_error(&[4, 5], WireError::RequestTimeout("rs-2".into()));
    counter.complete(1, vec![], true);
    assert!(!counter.wait_for_completion(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn step_future_waits_for_all_registered_locations() {
    let future = StepFuture::new("prepare");
    future.register_locations([Location::new("rs-2"), Location::new("rs-3")]);

    let future_clone = future.clone();
    tokio::spawn(async move {
        future_clone.success(&Location::new("rs-2"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        future_clone.success(&Location::new("rs-3"));
    });
    future
        .wait_for_completion(Duration::from_secs(2))
        .await
        .unwrap();

    // A retry round only waits for locations that have not succeeded yet.
    future.register_locations([Location::new("rs-2"), Location::new("rs-3")]);
    future
        .wait_for_completion(Duration::from_millis(100))
        .await
        .unwrap();
}

#[tokio::test]
async fn step_future_propagates_errors_and_timeouts() {
    let future = StepFuture::new("commit");
    future.register_locations([Location::new("rs-2")]);
    future.failure(
        &Location::new("rs-2"),
        WireError::PhantomRangeMapNotFound("rs-1".into()),
    );
    assert!(matches!(
        future.wait_for_completion(Duration::from_secs(1)).await,
        Err(tesseradb::core::TesseraError::PhantomRangeMapNotFound(_))
    ));

    let future = StepFuture::new("commit");
    future.register_locations([Location::new("rs-2")]);
    assert!(matches!(
        future.wait_for_completion(Duration::from_millis(80)).await,
        Err(tesseradb::core::TesseraError::RequestTimeout(_))
    ));
}

#[tokio::test]
async fn sub_operation_parks_below_quorum() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, &["rs-1", "rs-2", "rs-3"]).await;
    for name in ["rs-1", "rs-2", "rs-3"] {
        ctx.rsc_manager.disconnect_server(&Location::new(name));
    }

    let mut op = OperationRecoverRanges::new(1, Location::new("rs-1"), RangeType::User);
    op.execute(&ctx).await.unwrap();
    assert_eq!(op.state(), RecoverRangesState::Initial);
    assert!(!op.is_done());
}

#[tokio::test]
async fn sub_operation_with_no_plan_completes() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, &["rs-1", "rs-2"]).await;

    // No recovery plan exists for rs-1 at all: nothing to do.
    let mut op = OperationRecoverRanges::new(1, Location::new("rs-1"), RangeType::User);
    op.execute(&ctx).await.unwrap();
    assert!(op.is_done());
}

#[tokio::test]
async fn plan_generation_bump_restarts_the_phase() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, &["rs-1", "rs-2"]).await;
    let failed = Location::new("rs-1");
    ctx.rsc_manager.disconnect_server(&failed);
    ctx.bpa
        .create_recovery_plan(
            &failed,
            [
                vec![],
                vec![],
                vec![],
                vec![(user_range("m"), RangeState::steady())],
            ],
        )
        .await
        .unwrap();

    let mut op = OperationRecoverRanges::new(1, failed.clone(), RangeType::User);
    // The destination is unreachable, so the phantom-load phase fails and
    // pins the operation in PHANTOM_LOAD.
    assert!(op.execute(&ctx).await.is_err());
    assert_eq!(op.state(), RecoverRangesState::PhantomLoad);
    let generation_seen = op.plan_generation();

    // Any authority mutation invalidates the in-flight phase; on re-entry
    // the operation re-reads the plan and restarts from the top.
    ctx.bpa
        .register_move(RangeMoveSpec::new(
            TableId::new("u9", 1),
            RangeSpec::new("", ""),
            Location::new("rs-2"),
        ))
        .await
        .unwrap();
    assert!(op.execute(&ctx).await.is_err());
    assert!(op.plan_generation() > generation_seen);
    assert_eq!(op.state(), RecoverRangesState::PhantomLoad);
}

#[tokio::test]
async fn recovery_aborts_when_the_server_is_actually_alive() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, &["rs-1", "rs-2"]).await;
    let location = Location::new("rs-1");
    ctx.rsc_manager.set_recovering(&location, true);

    // The server's own session still holds the location lock.
    let server_session = ctx.hyperspace.create_session();
    try_lock_exclusive(&ctx.hyperspace, server_session, "/tessera/servers/rs-1")
        .await
        .unwrap();

    let mut op = OperationRecover::new(1, location.clone());
    op.execute(&ctx).await.unwrap();
    assert!(op.is_done());
    assert!(!ctx.rsc_manager.is_recovering(&location));
}
