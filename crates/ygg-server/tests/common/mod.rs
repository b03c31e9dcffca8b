//! In-process multi-group harness for the replica tests.
#![allow(dead_code)] // each test binary uses a different slice of the harness

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use ygg_client::Clerk;
use ygg_consensus::mem::{MemCluster, MemLog};
use ygg_ctrl::MemController;
use ygg_net::mem::MemNetwork;
use ygg_server::ShardServer;
use ygg_types::{GroupId, N_SHARDS};

pub type Server = ShardServer<MemLog, MemController, MemNetwork>;

pub struct TestGroup {
    pub cluster: MemCluster,
    pub servers: Vec<Arc<Server>>,
}

pub struct TestCluster {
    pub net: MemNetwork,
    pub ctrl: MemController,
    pub groups: BTreeMap<GroupId, TestGroup>,
    max_log_bytes: Option<u64>,
}

pub fn server_name(gid: GroupId, me: usize) -> String {
    format!("{gid}-{me}")
}

impl TestCluster {
    pub fn new(max_log_bytes: Option<u64>) -> Self {
        TestCluster {
            net: MemNetwork::new(),
            ctrl: MemController::new(),
            groups: BTreeMap::new(),
            max_log_bytes,
        }
    }

    /// Spawn a group with `replicas` servers; replica 0 starts as leader.
    pub fn spawn_group(&mut self, gid: GroupId, replicas: usize) {
        let cluster = MemCluster::new(replicas);
        let mut servers = Vec::new();
        for me in 0..replicas {
            servers.push(self.spawn_server(&cluster, gid, me));
        }
        cluster.set_leader(0);
        self.groups.insert(gid, TestGroup { cluster, servers });
    }

    fn spawn_server(&self, cluster: &MemCluster, gid: GroupId, me: usize) -> Arc<Server> {
        let (raft, apply_rx) = cluster.attach(me);
        let server = ShardServer::start(
            raft,
            apply_rx,
            self.ctrl.clone(),
            self.net.clone(),
            gid,
            me,
            self.max_log_bytes,
        );
        server.serve(self.net.bind(&server_name(gid, me)));
        server
    }

    pub fn server(&self, gid: GroupId, me: usize) -> Arc<Server> {
        self.groups[&gid].servers[me].clone()
    }

    pub fn kill_server(&self, gid: GroupId, me: usize) {
        self.groups[&gid].servers[me].kill();
        self.net.disconnect(&server_name(gid, me));
    }

    /// Bring a killed replica back on a fresh apply stream; it recovers
    /// from the engine's snapshot plus the retained log tail.
    pub fn restart_server(&mut self, gid: GroupId, me: usize) {
        let cluster = self.groups[&gid].cluster.clone();
        let server = self.spawn_server(&cluster, gid, me);
        self.groups.get_mut(&gid).unwrap().servers[me] = server;
    }

    /// Publish the next config assigning shards per `shards`; membership
    /// covers every spawned group.
    pub fn publish(&self, shards: [GroupId; N_SHARDS]) -> u64 {
        let membership = self
            .groups
            .iter()
            .map(|(&gid, group)| {
                let names = (0..group.servers.len()).map(|me| server_name(gid, me)).collect();
                (gid, names)
            })
            .collect();
        self.ctrl.publish(shards, membership)
    }

    pub fn clerk(&self) -> Clerk<MemController, MemNetwork> {
        Clerk::new(self.ctrl.clone(), self.net.clone())
    }

    pub fn kill_all(&self) {
        for group in self.groups.values() {
            for server in &group.servers {
                server.kill();
            }
        }
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
