//! Log compaction: snapshots are taken under load and a restarted replica
//! recovers every acknowledged write from snapshot plus log tail.

mod common;

use std::time::Duration;

use tokio::time::timeout;

use common::{eventually, TestCluster};
use ygg_types::N_SHARDS;

#[tokio::test]
async fn restart_from_snapshot_serves_acknowledged_keys() {
    let mut tc = TestCluster::new(Some(1_000));
    tc.spawn_group(1, 3);
    tc.publish([1; N_SHARDS]);

    let clerk = tc.clerk();
    for i in 0..60 {
        let key = format!("key{i:02}");
        let value = format!("v{i}");
        timeout(Duration::from_secs(10), clerk.put(&key, &value))
            .await
            .expect("put stalled");
    }

    // The writes pushed the log past its byte budget; compaction must kick
    // in.
    let cluster = tc.groups[&1].cluster.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let cluster = cluster.clone();
            async move { cluster.last_included() > 0 }
        })
        .await,
        "no snapshot was taken",
    );

    // Crash a follower, bring it back, and make it the leader: it must
    // answer purely from what it recovered.
    tc.kill_server(1, 2);
    tc.restart_server(1, 2);
    cluster.set_leader(2);

    for i in 0..60 {
        let key = format!("key{i:02}");
        let value = timeout(Duration::from_secs(10), clerk.get(&key))
            .await
            .expect("get stalled");
        assert_eq!(value, format!("v{i}"), "lost write for {key}");
    }
    tc.kill_all();
}
