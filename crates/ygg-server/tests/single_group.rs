//! One group, no reconfiguration: linearized writes, at-most-once retries,
//! and preempted proposals.

mod common;

use std::time::Duration;

use common::{eventually, TestCluster};
use ygg_types::{GetArgs, KvError, PutAppendArgs, WriteKind, N_SHARDS};

fn get_args(key: &str, client_id: u64, op_id: u64) -> GetArgs {
    GetArgs { key: key.into(), config_num: 1, client_id, op_id }
}

fn write_args(key: &str, value: &str, kind: WriteKind, client_id: u64, op_id: u64) -> PutAppendArgs {
    PutAppendArgs { key: key.into(), value: value.into(), kind, config_num: 1, client_id, op_id }
}

#[tokio::test]
async fn writes_from_two_clients_interleave_in_log_order() {
    let mut tc = TestCluster::new(None);
    tc.spawn_group(1, 3);
    tc.publish([1; N_SHARDS]);

    let c1 = tc.clerk();
    let c2 = tc.clerk();
    c1.put("x", "1").await;
    c2.append("x", "2").await;

    // Both acknowledged writes are visible to both clients.
    assert_eq!(c1.get("x").await, "12");
    assert_eq!(c2.get("x").await, "12");
    tc.kill_all();
}

#[tokio::test]
async fn retried_write_applies_once_across_leader_change() {
    let mut tc = TestCluster::new(None);
    tc.spawn_group(1, 3);
    tc.publish([1; N_SHARDS]);

    let leader = tc.server(1, 0);
    assert!(
        eventually(Duration::from_secs(5), || {
            let leader = leader.clone();
            async move {
                leader.put_append(write_args("x", "1", WriteKind::Put, 77, 1)).await == Ok(())
            }
        })
        .await,
        "leader never adopted the initial config",
    );

    // The reply to op 2 is "lost"; the client retries against the same
    // leader, then against a new one.
    assert_eq!(
        leader.put_append(write_args("x", "2", WriteKind::Append, 77, 2)).await,
        Ok(())
    );
    assert_eq!(
        leader.put_append(write_args("x", "2", WriteKind::Append, 77, 2)).await,
        Ok(())
    );

    tc.groups[&1].cluster.set_leader(1);
    let new_leader = tc.server(1, 1);
    assert!(
        eventually(Duration::from_secs(5), || {
            let new_leader = new_leader.clone();
            async move {
                new_leader.put_append(write_args("x", "2", WriteKind::Append, 77, 2)).await
                    == Ok(())
            }
        })
        .await
    );

    // Three deliveries, one application.
    assert_eq!(new_leader.get(get_args("x", 78, 1)).await, Ok("12".into()));
    tc.kill_all();
}

#[tokio::test]
async fn preempted_proposal_reports_wrong_leader() {
    let mut tc = TestCluster::new(None);
    tc.spawn_group(1, 2);
    tc.publish([1; N_SHARDS]);

    let s0 = tc.server(1, 0);
    assert!(
        eventually(Duration::from_secs(5), || {
            let s0 = s0.clone();
            async move { s0.get(get_args("probe", 1, 1)).await == Ok(String::new()) }
        })
        .await
    );

    // Freeze the log so the old leader's proposal sits uncommitted, then
    // let a new leader claim the same index with a different entry.
    let cluster = tc.groups[&1].cluster.clone();
    cluster.pause();
    let loser = {
        let s0 = s0.clone();
        tokio::spawn(async move {
            s0.put_append(write_args("k", "v-lost", WriteKind::Put, 50, 1)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cluster.set_leader(1);
    let s1 = tc.server(1, 1);
    let winner = {
        let s1 = s1.clone();
        tokio::spawn(async move {
            s1.put_append(write_args("k", "v-won", WriteKind::Put, 51, 1)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.resume();

    assert_eq!(loser.await.unwrap(), Err(KvError::WrongLeader));
    assert_eq!(winner.await.unwrap(), Ok(()));
    assert_eq!(s1.get(get_args("k", 52, 1)).await, Ok("v-won".into()));
    tc.kill_all();
}
