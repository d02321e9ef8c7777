use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use tesseradb::core::TesseraError;
use tesseradb::core::balance::BalancePlanAuthority;
use tesseradb::core::dfs::{Dfs, LocalDfs};
use tesseradb::core::master::connection_manager::RangeServerConnectionManager;
use tesseradb::core::metalog::{Entity, MetalogWriter};
use tesseradb::core::types::{
    Location, QualifiedRange, RangeMoveSpec, RangeSpec, RangeState, RangeType, TableId,
};

struct Fixture {
    _dir: TempDir,
    dfs: Arc<dyn Dfs>,
    rsc: Arc<RangeServerConnectionManager>,
    mml: Arc<MetalogWriter>,
}

async fn fixture(servers: &[&str]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let dfs: Arc<dyn Dfs> = Arc::new(LocalDfs::new(dir.path()));
    let rsc = Arc::new(RangeServerConnectionManager::new());
    for (i, name) in servers.iter().enumerate() {
        rsc.connect_server(
            Location::new(*name),
            "127.0.0.1".to_string(),
            format!("127.0.0.1:{}", 38061 + i).parse().unwrap(),
        );
    }
    let (mml, _) = MetalogWriter::open(dfs.clone(), "/tessera/master/mml")
        .await
        .unwrap();
    Fixture {
        _dir: dir,
        dfs,
        rsc,
        mml: Arc::new(mml),
    }
}

async fn authority(fx: &Fixture) -> Arc<BalancePlanAuthority> {
    BalancePlanAuthority::new(
        fx.dfs.clone(),
        "/tessera",
        fx.rsc.clone(),
        fx.mml.clone(),
        None,
    )
    .await
    .unwrap()
}

fn user_range(end: &str) -> QualifiedRange {
    QualifiedRange::new(TableId::new("u1", 1), RangeSpec::new("", end))
}

#[tokio::test]
async fn duplicate_moves_are_rejected() {
    let fx = fixture(&["rs-1", "rs-2"]).await;
    let bpa = authority(&fx).await;

    let spec = RangeMoveSpec::new(
        TableId::new("u1", 1),
        RangeSpec::new("", "m"),
        Location::new("rs-2"),
    );
    bpa.register_move(spec.clone()).await.unwrap();

    // Same (table, range) with a different generation and destination is
    // still the same move.
    let dup = RangeMoveSpec::new(
        TableId::new("u1", 7),
        RangeSpec::new("", "m"),
        Location::new("rs-1"),
    );
    assert!(matches!(
        bpa.register_move(dup).await,
        Err(TesseraError::DuplicateMove(_))
    ));

    // A registered move pins the destination.
    let dest = bpa
        .get_balance_destination(&TableId::new("u1", 1), &RangeSpec::new("", "m"))
        .unwrap();
    assert_eq!(dest, Location::new("rs-2"));

    bpa.move_complete(&TableId::new("u1", 1), &RangeSpec::new("", "m"), None)
        .await
        .unwrap();
    bpa.register_move(spec).await.unwrap();
}

#[tokio::test]
async fn create_recovery_plan_round_robins_over_survivors() {
    let fx = fixture(&["rs-1", "rs-2", "rs-3"]).await;
    let bpa = authority(&fx).await;
    let failed = Location::new("rs-1");
    fx.rsc.disconnect_server(&failed);

    // Fragments 0..4 in the failed server's user log.
    for id in 0..4u32 {
        fx.dfs
            .append(
                &format!("/tessera/servers/rs-1/log/user/{id:010}"),
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap();
    }

    let ranges = vec![
        (user_range("d"), RangeState::steady()),
        (user_range("h"), RangeState::steady()),
        (user_range("m"), RangeState::steady()),
        (user_range(""), RangeState::steady()),
    ];
    let generation_before = bpa.generation();
    bpa.create_recovery_plan(&failed, [vec![], vec![], vec![], ranges])
        .await
        .unwrap();
    assert!(bpa.generation() > generation_before);

    let (plan, generation) = bpa.copy_recovery_plan(&failed, RangeType::User).unwrap();
    assert_eq!(generation, bpa.generation());
    assert_eq!(plan.receiver_plan.len(), 4);
    assert_eq!(plan.replay_plan.fragments().len(), 4);

    // Only survivors receive work, spread evenly.
    let locations = plan.receiver_plan.locations();
    assert!(!locations.contains(&failed));
    assert_eq!(locations.len(), 2);
    for loc in &locations {
        assert_eq!(plan.receiver_plan.ranges_for(loc).len(), 2);
        assert_eq!(plan.replay_plan.fragments_for(loc).len(), 2);
    }

    // Empty types have empty plans.
    let (root_plan, _) = bpa.copy_recovery_plan(&failed, RangeType::Root).unwrap();
    assert!(root_plan.receiver_plan.is_empty());
}

#[tokio::test]
async fn second_failure_reroutes_existing_plans() {
    let fx = fixture(&["rs-1", "rs-2", "rs-3"]).await;
    let bpa = authority(&fx).await;
    let rs1 = Location::new("rs-1");
    let rs3 = Location::new("rs-3");

    fx.rsc.disconnect_server(&rs1);
    bpa.create_recovery_plan(
        &rs1,
        [
            vec![],
            vec![],
            vec![],
            vec![
                (user_range("m"), RangeState::steady()),
                (user_range(""), RangeState::steady()),
            ],
        ],
    )
    .await
    .unwrap();
    let generation_after_first = bpa.generation();

    // rs-3 dies too: its share of rs-1's plan must move to rs-2.
    fx.rsc.disconnect_server(&rs3);
    bpa.create_recovery_plan(&rs3, [vec![], vec![], vec![], vec![]])
        .await
        .unwrap();
    assert!(bpa.generation() > generation_after_first);

    let (plan, _) = bpa.copy_recovery_plan(&rs1, RangeType::User).unwrap();
    let locations = plan.receiver_plan.locations();
    assert_eq!(locations.len(), 1);
    assert!(locations.contains(&Location::new("rs-2")));
}

#[tokio::test]
async fn acknowledge_shrinks_receiver_plan() {
    let fx = fixture(&["rs-1", "rs-2"]).await;
    let bpa = authority(&fx).await;
    let failed = Location::new("rs-1");
    fx.rsc.disconnect_server(&failed);

    bpa.create_recovery_plan(
        &failed,
        [
            vec![],
            vec![],
            vec![],
            vec![
                (user_range("m"), RangeState::steady()),
                (user_range(""), RangeState::steady()),
            ],
        ],
    )
    .await
    .unwrap();

    bpa.remove_from_receiver_plan(&failed, RangeType::User, &[user_range("m")])
        .await
        .unwrap();
    let (plan, _) = bpa.copy_recovery_plan(&failed, RangeType::User).unwrap();
    assert_eq!(plan.receiver_plan.len(), 1);
    assert!(plan.receiver_plan.location_of(&user_range("m")).is_none());

    bpa.remove_recovery_plan(&failed).await.unwrap();
    assert!(bpa.copy_recovery_plan(&failed, RangeType::User).is_none());
    assert!(bpa.is_empty());
}

#[tokio::test]
async fn withdrawn_destination_is_dropped_or_rerouted() {
    let fx = fixture(&["rs-1", "rs-2", "rs-3"]).await;
    let bpa = authority(&fx).await;
    let failed = Location::new("rs-1");
    fx.rsc.disconnect_server(&failed);

    for id in 0..2u32 {
        fx.dfs
            .append(
                &format!("/tessera/servers/rs-1/log/user/{id:010}"),
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap();
    }
    bpa.create_recovery_plan(
        &failed,
        [
            vec![],
            vec![],
            vec![],
            vec![
                (user_range("m"), RangeState::steady()),
                (user_range(""), RangeState::steady()),
            ],
        ],
    )
    .await
    .unwrap();

    let (plan, _) = bpa.copy_recovery_plan(&failed, RangeType::User).unwrap();
    let withdrawn = plan.receiver_plan.locations().iter().next().unwrap().clone();
    let withdrawn_ranges = plan.receiver_plan.ranges_for(&withdrawn).len();
    assert!(withdrawn_ranges > 0);

    // Default policy: the withdrawn destination's ranges are treated as
    // already recovered; its replay work moves elsewhere.
    bpa.remove_from_replay_plan(&failed, RangeType::User, &withdrawn, false)
        .await
        .unwrap();
    let (plan, _) = bpa.copy_recovery_plan(&failed, RangeType::User).unwrap();
    assert!(plan.receiver_plan.ranges_for(&withdrawn).is_empty());
    assert!(plan.replay_plan.fragments_for(&withdrawn).is_empty());
    assert_eq!(plan.replay_plan.fragments().len(), 2);
    assert_eq!(plan.receiver_plan.len(), 2 - withdrawn_ranges);
}

#[tokio::test]
async fn authority_state_survives_restart() {
    let fx = fixture(&["rs-1", "rs-2"]).await;
    {
        let bpa = authority(&fx).await;
        let failed = Location::new("rs-1");
        fx.rsc.disconnect_server(&failed);
        bpa.create_recovery_plan(
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
        bpa.register_move(RangeMoveSpec::new(
            TableId::new("u2", 1),
            RangeSpec::new("", ""),
            Location::new("rs-2"),
        ))
        .await
        .unwrap();
    }

    // Reopen the metalog and rebuild the authority from the recovered entity.
    let (mml, entities) = MetalogWriter::open(fx.dfs.clone(), "/tessera/master/mml")
        .await
        .unwrap();
    let recovered = entities.into_values().find_map(|e| match e {
        Entity::BalancePlanAuthority(e) => Some(e),
        _ => None,
    });
    assert!(recovered.is_some());

    let bpa = BalancePlanAuthority::new(
        fx.dfs.clone(),
        "/tessera",
        fx.rsc.clone(),
        Arc::new(mml),
        recovered,
    )
    .await
    .unwrap();
    let (plan, _) = bpa
        .copy_recovery_plan(&Location::new("rs-1"), RangeType::User)
        .unwrap();
    assert_eq!(plan.receiver_plan.len(), 1);
    assert_eq!(
        bpa.get_balance_destination(&TableId::new("u2", 5), &RangeSpec::new("", ""))
            .unwrap(),
        Location::new("rs-2")
    );
}
