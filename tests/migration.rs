//! End-to-end shard migration scenarios over in-process groups.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{bounded, key_of_shard, server_name, wait_until, Cluster, FAST_CONFIG};
use shardkv::{
    ApiRequest, GroupId, HandoffArgs, Outcome, PeerNetwork, PutOp,
    ShardKvError, ShardState, StaticCtrler, NUM_SHARDS,
};
use tokio::time;

const A: GroupId = 100;
const B: GroupId = 101;
const C: GroupId = 102;

fn shards_to(owners: &[(std::ops::Range<usize>, GroupId)]) -> [GroupId; NUM_SHARDS] {
    let mut shards = [0; NUM_SHARDS];
    for (range, gid) in owners {
        for shard in range.clone() {
            shards[shard] = *gid;
        }
    }
    shards
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shard_moves_between_groups() -> Result<(), ShardKvError> {
    let mut cluster = Cluster::new();
    cluster.add_group(A, 3).await?;
    cluster.add_group(B, 3).await?;
    cluster.reconfigure([A; NUM_SHARDS])?;
    cluster.wait_settled(A, 1).await?;

    let mut clerk = cluster.clerk().await?;
    for shard in 0..NUM_SHARDS {
        bounded(clerk.put(&key_of_shard(shard, "k"), &format!("v{}", shard))).await?;
    }

    let moved = shards_to(&[(0..3, A), (3..4, B), (4..NUM_SHARDS, A)]);
    let num = cluster.reconfigure(moved)?;
    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;

    let key3 = key_of_shard(3, "k");
    for server in cluster.live_replicas(A) {
        assert!(!server.holds_key(&key3));
        assert!(server.holds_key(&key_of_shard(4, "k")));
    }
    for server in cluster.live_replicas(B) {
        assert!(server.holds_key(&key3));
        assert_eq!(server.shard_states()[3], ShardState::Serving);
    }

    for shard in 0..NUM_SHARDS {
        let key = key_of_shard(shard, "k");
        assert_eq!(bounded(clerk.get(&key)).await?, Some(format!("v{}", shard)));
    }
    bounded(clerk.append(&key3, "+")).await?;
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v3+".into()));

    // the old owner now turns the shard away
    let reply = cluster
        .network
        .call(&server_name(A, 0), ApiRequest::Get { key: key3 })
        .await;
    assert_eq!(reply.map(|r| r.outcome), Some(Outcome::WrongGroup));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_write_applies_once() -> Result<(), ShardKvError> {
    let mut cluster = Cluster::new();
    cluster.add_group(A, 1).await?;
    cluster.reconfigure([A; NUM_SHARDS])?;
    cluster.wait_settled(A, 1).await?;

    let leader = server_name(A, 0);
    let append = |seq| ApiRequest::PutAppend {
        key: "x".into(),
        value: "a".into(),
        op: PutOp::Append,
        client: 7,
        seq,
    };
    for req in [append(1), append(1), append(2), append(1)] {
        let reply = cluster.network.call(&leader, req).await;
        assert_eq!(reply.map(|r| r.outcome), Some(Outcome::Ok));
    }
    let reply = cluster
        .network
        .call(&leader, ApiRequest::Get { key: "x".into() })
        .await;
    assert_eq!(reply.and_then(|r| r.value), Some("aa".into()));

    // non-primary replicas refuse
    cluster.add_group(B, 2).await?;
    let reply = cluster
        .network
        .call(&server_name(B, 1), ApiRequest::Get { key: "x".into() })
        .await;
    assert_eq!(reply.map(|r| r.outcome), Some(Outcome::NotLeader));

    cluster.shutdown().await
}

/// Group B learns configurations from its own, lagging ctrler.
async fn cluster_with_lagging_receiver(
    pusher_config: &str,
    pusher_population: usize,
) -> Result<(Cluster, Arc<StaticCtrler>), ShardKvError> {
    let mut cluster = Cluster::new();
    let lagging = Arc::new(StaticCtrler::new());
    let ctrler = cluster.ctrler.clone();
    cluster
        .add_group_with(A, pusher_population, ctrler, pusher_config)
        .await?;
    cluster.add_group_with(B, 1, lagging.clone(), FAST_CONFIG).await?;

    let first = [A; NUM_SHARDS];
    cluster.reconfigure(first)?;
    lagging.install(first, cluster.memberships())?;
    cluster.wait_settled(A, 1).await?;
    cluster.wait_settled(B, 1).await?;
    Ok((cluster, lagging))
}

fn shard3_to_b() -> [GroupId; NUM_SHARDS] {
    shards_to(&[(0..3, A), (3..4, B), (4..NUM_SHARDS, A)])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_receiver_catches_up() -> Result<(), ShardKvError> {
    let (cluster, lagging) = cluster_with_lagging_receiver(FAST_CONFIG, 1).await?;
    let mut clerk = cluster.clerk().await?;
    let key3 = key_of_shard(3, "k");
    bounded(clerk.put(&key3, "v")).await?;

    let num = cluster.reconfigure(shard3_to_b())?;
    let pusher = cluster.replica(A, 0)?;
    wait_until(Duration::from_secs(5), || pusher.config_num() == num).await?;
    assert_eq!(pusher.shard_states()[3], ShardState::Pushing);

    // receiver still behind: pushes are answered StaleConfig, nothing moves
    let probe = HandoffArgs {
        num,
        origin: A,
        shards: vec![3],
        kv: HashMap::new(),
        dedup: HashMap::new(),
        client: 1,
        seq: 1,
    };
    let reply = cluster
        .network
        .call(&server_name(B, 0), ApiRequest::Handoff(probe))
        .await;
    assert_eq!(reply.map(|r| r.outcome), Some(Outcome::StaleConfig));
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pusher.shard_states()[3], ShardState::Pushing);
    assert!(pusher.holds_key(&key3));
    assert!(pusher.fatal_error().is_none());

    lagging.install(shard3_to_b(), cluster.memberships())?;
    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;
    assert!(!pusher.holds_key(&key3));
    assert!(cluster.replica(B, 0)?.holds_key(&key3));
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v".into()));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_pushing() -> Result<(), ShardKvError> {
    // snapshot after every applied entry
    let config = format!("{}\nmax_state_size = 1", FAST_CONFIG);
    let (mut cluster, lagging) = cluster_with_lagging_receiver(&config, 1).await?;
    let mut clerk = cluster.clerk().await?;
    let key3 = key_of_shard(3, "k");
    bounded(clerk.put(&key3, "v")).await?;

    let num = cluster.reconfigure(shard3_to_b())?;
    let pusher = cluster.replica(A, 0)?;
    wait_until(Duration::from_secs(5), || pusher.config_num() == num).await?;

    cluster.crash_replica(A, 0).await?;
    let restarted = cluster.start_replica(A, 0).await?;
    wait_until(Duration::from_secs(5), || restarted.config_num() == num).await?;
    assert_eq!(restarted.shard_states()[3], ShardState::Pushing);
    assert!(restarted.holds_key(&key3));

    lagging.install(shard3_to_b(), cluster.memberships())?;
    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;
    assert!(!restarted.holds_key(&key3));
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v".into()));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_primary_resumes_pushing() -> Result<(), ShardKvError> {
    let (mut cluster, lagging) = cluster_with_lagging_receiver(FAST_CONFIG, 2).await?;
    let mut clerk = cluster.clerk().await?;
    let key3 = key_of_shard(3, "k");
    bounded(clerk.put(&key3, "v")).await?;

    let num = cluster.reconfigure(shard3_to_b())?;
    let backup = cluster.replica(A, 1)?;
    wait_until(Duration::from_secs(5), || backup.config_num() == num).await?;
    assert_eq!(backup.shard_states()[3], ShardState::Pushing);

    // the proposer dies before the receiver is ready
    cluster.crash_replica(A, 0).await?;
    cluster.groups[&A].log.set_leader(Some(1))?;
    lagging.install(shard3_to_b(), cluster.memberships())?;

    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;
    assert!(!backup.holds_key(&key3));
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v".into()));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accepted_push_resent_after_receiver_failover() -> Result<(), ShardKvError> {
    let mut cluster = Cluster::new();
    cluster.add_group(A, 1).await?;
    cluster.add_group(B, 2).await?;
    cluster.reconfigure([A; NUM_SHARDS])?;
    cluster.wait_settled(A, 1).await?;
    let mut clerk = cluster.clerk().await?;
    let key3 = key_of_shard(3, "k");
    bounded(clerk.put(&key3, "v")).await?;

    // B can reach A's replica no more: its HandoffDone cannot get through
    cluster.network.set_connected(&server_name(A, 0), false);
    let num = cluster.reconfigure(shard3_to_b())?;
    let pusher = cluster.replica(A, 0)?;
    let backup = cluster.replica(B, 1)?;
    wait_until(Duration::from_secs(5), || {
        backup.config_num() == num
            && backup.shard_states()[3] == ShardState::Serving
    })
    .await?;
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pusher.shard_states()[3], ShardState::Pushing);

    // the receiver's primary dies along with its pending HandoffDone
    cluster.crash_replica(B, 0).await?;
    cluster.groups[&B].log.set_leader(Some(1))?;
    cluster.network.set_connected(&server_name(A, 0), true);

    cluster.wait_settled(A, num).await?;
    assert!(!pusher.holds_key(&key3));
    assert!(backup.holds_key(&key3));
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v".into()));
    assert!(pusher.fatal_error().is_none());

    // later configurations are no longer blocked
    let num = cluster.reconfigure([A; NUM_SHARDS])?;
    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v".into()));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_replica_catches_up_by_snapshot() -> Result<(), ShardKvError> {
    // snapshot after every applied entry, so the log keeps little
    let config = format!("{}\nmax_state_size = 1", FAST_CONFIG);
    let (mut cluster, lagging) = cluster_with_lagging_receiver(&config, 2).await?;
    let mut clerk = cluster.clerk().await?;
    let key0 = key_of_shard(0, "k");
    let key3 = key_of_shard(3, "k");
    bounded(clerk.put(&key0, "a")).await?;

    cluster.crash_replica(A, 1).await?;
    let primary = cluster.replica(A, 0)?;
    let truncated_from = cluster.groups[&A].log.next_index()?;
    bounded(clerk.append(&key0, "b")).await?;
    bounded(clerk.put(&key3, "v")).await?;
    let num = cluster.reconfigure(shard3_to_b())?;
    wait_until(Duration::from_secs(5), || primary.config_num() == num).await?;
    assert!(primary.last_applied() >= truncated_from);

    // everything the crashed replica missed is gone from the log
    let back = cluster.start_replica(A, 1).await?;
    wait_until(Duration::from_secs(5), || {
        back.last_applied() >= primary.last_applied()
    })
    .await?;
    assert_eq!(back.config_num(), num);
    assert_eq!(back.shard_states()[3], ShardState::Pushing);
    assert!(back.holds_key(&key3));
    assert!(back.holds_key(&key0));

    // the caught-up replica takes over and finishes the migration
    cluster.crash_replica(A, 0).await?;
    cluster.groups[&A].log.set_leader(Some(1))?;
    assert_eq!(bounded(clerk.get(&key0)).await?, Some("ab".into()));
    lagging.install(shard3_to_b(), cluster.memberships())?;
    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;
    assert!(!back.holds_key(&key3));
    assert_eq!(bounded(clerk.get(&key3)).await?, Some("v".into()));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover_keeps_data() -> Result<(), ShardKvError> {
    let mut cluster = Cluster::new();
    cluster.add_group(A, 3).await?;
    cluster.add_group(B, 3).await?;
    cluster.reconfigure([A; NUM_SHARDS])?;
    cluster.wait_settled(A, 1).await?;

    let mut clerk = cluster.clerk().await?;
    for shard in 0..NUM_SHARDS {
        bounded(clerk.put(&key_of_shard(shard, "f"), "1")).await?;
    }

    cluster.crash_replica(A, 0).await?;
    cluster.groups[&A].log.set_leader(Some(2))?;
    for shard in 0..NUM_SHARDS {
        bounded(clerk.append(&key_of_shard(shard, "f"), "2")).await?;
    }

    // the new primary drives the next migration
    let num = cluster.reconfigure(shards_to(&[(0..5, A), (5..NUM_SHARDS, B)]))?;
    cluster.wait_settled(A, num).await?;
    cluster.wait_settled(B, num).await?;
    for shard in 0..NUM_SHARDS {
        let key = key_of_shard(shard, "f");
        assert_eq!(bounded(clerk.get(&key)).await?, Some("12".into()));
    }

    // a restarted replica catches up from the log
    let back = cluster.start_replica(A, 0).await?;
    wait_until(Duration::from_secs(5), || {
        back.config_num() == num
            && back.shard_states().iter().all(|&s| s == ShardState::Serving)
    })
    .await?;
    assert!(back.holds_key(&key_of_shard(0, "f")));
    assert!(!back.holds_key(&key_of_shard(9, "f")));

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inconsistent_configs_halt_pusher() -> Result<(), ShardKvError> {
    let (cluster, lagging) = cluster_with_lagging_receiver(FAST_CONFIG, 1).await?;
    let num = cluster.reconfigure(shard3_to_b())?;
    // B is told shard 3 stays with A at the same number
    lagging.install([A; NUM_SHARDS], cluster.memberships())?;

    let pusher = cluster.replica(A, 0)?;
    wait_until(Duration::from_secs(5), || pusher.fatal_error().is_some()).await?;
    assert_eq!(pusher.config_num(), num);
    assert!(pusher.fatal_error().map_or(false, |e| e.is_protocol_violation()));
    assert!(pusher.is_killed());
    assert!(cluster.replica(B, 0)?.fatal_error().is_none());

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_clients_across_reconfigurations() -> Result<(), ShardKvError> {
    let mut cluster = Cluster::new();
    cluster.add_group(A, 3).await?;
    cluster.add_group(B, 3).await?;
    cluster.add_group(C, 3).await?;
    cluster.reconfigure([A; NUM_SHARDS])?;
    cluster.wait_settled(A, 1).await?;

    const ROUNDS: usize = 8;
    let mut workers = vec![];
    for client in 0..3 {
        let mut clerk = cluster.clerk().await?;
        workers.push(tokio::spawn(async move {
            for round in 0..ROUNDS {
                for shard in (client..NUM_SHARDS).step_by(3) {
                    let key = key_of_shard(shard, &format!("c{}", client));
                    clerk.append(&key, &format!("{};", round)).await?;
                }
            }
            Ok::<(), ShardKvError>(())
        }));
    }

    let plan = [
        shards_to(&[(0..5, A), (5..NUM_SHARDS, B)]),
        shards_to(&[(0..3, A), (3..7, B), (7..NUM_SHARDS, C)]),
        shards_to(&[(0..4, C), (4..8, A), (8..NUM_SHARDS, B)]),
        shards_to(&[(0..NUM_SHARDS, B)]),
        shards_to(&[(0..2, A), (2..6, C), (6..NUM_SHARDS, B)]),
    ];
    let mut last = 1;
    for shards in plan {
        last = cluster.reconfigure(shards)?;
        time::sleep(Duration::from_millis(150)).await;
    }
    for worker in workers {
        time::timeout(Duration::from_secs(30), worker).await???;
    }
    for gid in [A, B, C] {
        cluster.wait_settled(gid, last).await?;
    }

    let expected: String = (0..ROUNDS).map(|round| format!("{};", round)).collect();
    let final_owners = shards_to(&[(0..2, A), (2..6, C), (6..NUM_SHARDS, B)]);
    let mut clerk = cluster.clerk().await?;
    for client in 0..3 {
        for shard in (client..NUM_SHARDS).step_by(3) {
            let key = key_of_shard(shard, &format!("c{}", client));
            assert_eq!(bounded(clerk.get(&key)).await?, Some(expected.clone()));
            for gid in [A, B, C] {
                let held = cluster
                    .live_replicas(gid)
                    .iter()
                    .all(|server| server.holds_key(&key));
                let absent = cluster
                    .live_replicas(gid)
                    .iter()
                    .all(|server| !server.holds_key(&key));
                if gid == final_owners[shard] {
                    assert!(held, "{} missing from owner {}", key, gid);
                } else {
                    assert!(absent, "{} lingering in {}", key, gid);
                }
            }
        }
    }

    cluster.shutdown().await
}
