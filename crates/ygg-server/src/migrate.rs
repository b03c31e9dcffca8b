use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time;

use ygg_consensus::ReplicatedLog;
use ygg_ctrl::ControllerClient;
use ygg_net::Transport;
use ygg_types::{shard_of, Config, GroupId, KvError, MigrateArgs, N_SHARDS};

use crate::server::{ShardServer, MIGRATE_RETRY_PAUSE};

/// One batch of shard data leaving this group for a single target group
/// under a specific config transition.
#[derive(Debug)]
pub(crate) struct MigrateOut {
    pub config_num: u64,
    pub shards: Vec<usize>,
    pub data: BTreeMap<String, String>,
}

/// Per-target-group migration state. Created on the first hand-off to a
/// group and kept for the replica's lifetime; its sender task drains the
/// outbox.
pub(crate) struct MigrateEntry {
    pub config_num: u64,
    /// Last server of the target group that accepted a push.
    pub leader_hint: usize,
    pub outbox: mpsc::Sender<MigrateOut>,
}

/// Diff the outgoing and incoming configs and collect the data this group
/// must hand off, merged per destination group. Shards the new config
/// leaves unassigned have no destination and are simply dropped from
/// ownership.
pub(crate) fn outgoing_by_group(
    gid: GroupId,
    old: &Config,
    new: &Config,
    tbl: &BTreeMap<String, String>,
) -> Vec<(GroupId, MigrateOut)> {
    let mut by_group: HashMap<GroupId, MigrateOut> = HashMap::new();
    for shard in 0..N_SHARDS {
        let target = new.shards[shard];
        if old.shards[shard] != gid || target == gid || target == 0 {
            continue;
        }
        let out = by_group.entry(target).or_insert_with(|| MigrateOut {
            config_num: new.num,
            shards: Vec::new(),
            data: BTreeMap::new(),
        });
        out.shards.push(shard);
        for (key, value) in tbl {
            if shard_of(key) == shard {
                out.data.insert(key.clone(), value.clone());
            }
        }
    }
    by_group.into_iter().collect()
}

impl<R, C, T> ShardServer<R, C, T>
where
    R: ReplicatedLog,
    C: ControllerClient,
    T: Transport,
{
    /// Route an outgoing batch to the target group's sender task, creating
    /// the task on first contact. Stale batches (config older than the
    /// entry's) are dropped here.
    pub(crate) async fn trigger_migration(self: Arc<Self>, target: GroupId, out: MigrateOut) {
        let outbox = {
            let mut st = self.state.lock().await;
            match st.migrate_tbl.entry(target) {
                Entry::Vacant(slot) => {
                    let (tx, rx) = mpsc::channel(1);
                    slot.insert(MigrateEntry {
                        config_num: out.config_num,
                        leader_hint: 0,
                        outbox: tx.clone(),
                    });
                    tokio::spawn(self.clone().shard_sender(target, rx));
                    tx
                }
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    if out.config_num <= entry.config_num {
                        return;
                    }
                    entry.config_num = out.config_num;
                    entry.outbox.clone()
                }
            }
        };
        // Capacity-1 outbox: this parks only until the sender drains the
        // slot, and the drained batch is re-checked against the live config
        // there, so the latest plan wins.
        let mut quit = self.quit_tx.subscribe();
        tokio::select! {
            _ = outbox.send(out) => {}
            _ = quit.changed() => {}
        }
    }

    /// Long-lived sender for one target group.
    pub(crate) async fn shard_sender(self: Arc<Self>, target: GroupId, mut outbox: mpsc::Receiver<MigrateOut>) {
        let mut quit = self.quit_tx.subscribe();
        loop {
            let out = tokio::select! {
                out = outbox.recv() => match out {
                    Some(out) => out,
                    None => return,
                },
                _ = quit.changed() => return,
            };
            {
                let st = self.state.lock().await;
                if out.config_num != st.config.num {
                    continue; // superseded while parked in the outbox
                }
            }
            tracing::info!(
                gid = self.gid,
                me = self.me,
                target,
                config = out.config_num,
                shards = ?out.shards,
                "shipping shards"
            );
            self.push_shards(target, out).await;
        }
    }

    /// Deliver one batch: rotate through the target group's servers from the
    /// leader hint until one accepts, backing off per the reply. Gives up
    /// when this replica stops leading or its config moves past the batch.
    async fn push_shards(&self, target: GroupId, out: MigrateOut) {
        let args = {
            let mut st = self.state.lock().await;
            let args = MigrateArgs {
                config_num: out.config_num,
                shards: out.shards,
                data: out.data,
                client_id: st.client_id,
                op_id: st.op_id,
            };
            st.op_id += 1;
            args
        };

        while !self.killed() {
            if !self.raft.state().await.is_leader {
                // Whoever leads next derives this hand-off from its own
                // config apply.
                return;
            }
            let (servers, hint) = {
                let st = self.state.lock().await;
                if st.config.num != args.config_num {
                    return;
                }
                let servers = st.config.groups.get(&target).cloned().unwrap_or_default();
                let hint = st.migrate_tbl.get(&target).map_or(0, |entry| entry.leader_hint);
                (servers, hint)
            };
            if servers.is_empty() {
                return;
            }

            let n = servers.len();
            let mut server_id = hint % n;
            let mut tried = 0;
            while tried < n && !self.killed() {
                match self.net.migrate_shards(&servers[server_id], args.clone()).await {
                    None | Some(Err(KvError::WrongLeader)) | Some(Err(KvError::Shutdown)) => {
                        server_id = (server_id + 1) % n;
                        tried += 1;
                    }
                    Some(reply) => {
                        {
                            let mut st = self.state.lock().await;
                            if let Some(entry) = st.migrate_tbl.get_mut(&target) {
                                entry.leader_hint = server_id;
                            }
                        }
                        match reply {
                            Ok(()) => {
                                tracing::info!(
                                    gid = self.gid,
                                    me = self.me,
                                    target,
                                    config = args.config_num,
                                    "shards delivered"
                                );
                                return;
                            }
                            Err(KvError::UnknownConfig) => {
                                // Receiver is still catching up; same server
                                // will take it shortly.
                                time::sleep(MIGRATE_RETRY_PAUSE).await;
                            }
                            Err(KvError::OutdatedConfig) => {
                                self.kick_config_fetch();
                                time::sleep(MIGRATE_RETRY_PAUSE).await;
                            }
                            Err(_) => {
                                server_id = (server_id + 1) % n;
                                tried += 1;
                            }
                        }
                    }
                }
            }
            time::sleep(MIGRATE_RETRY_PAUSE).await;
        }
    }
}
