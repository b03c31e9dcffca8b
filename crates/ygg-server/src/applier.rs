use std::sync::Arc;

use tokio::sync::mpsc;

use ygg_consensus::{ApplyMsg, ReplicatedLog};
use ygg_ctrl::ControllerClient;
use ygg_net::Transport;
use ygg_types::{shard_of, Config, GroupId, KvError, Op, RequestKind, RequestOp};

use crate::migrate::{outgoing_by_group, MigrateOut};
use crate::server::{CachedReply, ServerState, ShardServer, SNAPSHOT_OPS_INTERVAL};
use crate::snapshot;

impl<R, C, T> ShardServer<R, C, T>
where
    R: ReplicatedLog,
    C: ControllerClient,
    T: Transport,
{
    /// Single consumer of the apply stream and sole mutator of replica
    /// state. Runs until the engine closes the stream.
    pub(crate) async fn applier(self: Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        // Resume the snapshot-trigger cursor from the engine's compaction
        // point so a recovering replica does not immediately re-trigger.
        let mut last_triggered = self.raft.last_included_index().await;
        self.state.lock().await.applied_index = last_triggered;

        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Snapshot { index, data, .. } => {
                    self.install_snapshot(index, &data).await;
                }
                ApplyMsg::Command { index, op } => {
                    if index - last_triggered > SNAPSHOT_OPS_INTERVAL
                        && self.snap_tx.try_send(()).is_ok()
                    {
                        last_triggered = index;
                    }
                    match op {
                        Op::Reconfigure(config) => {
                            for (target, out) in self.apply_reconfigure(index, config).await {
                                tokio::spawn(self.clone().trigger_migration(target, out));
                            }
                        }
                        Op::Request(req) => self.apply_request(index, req).await,
                    }
                }
            }
        }

        // Engine gone. Dropping the pending rendezvous channels resolves
        // every waiting front-end with Shutdown.
        self.state.lock().await.command_tbl.clear();
    }

    /// Replace replica state with a snapshot the engine installed.
    async fn install_snapshot(&self, index: u64, data: &[u8]) {
        let persisted = match snapshot::decode_state(data) {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::error!(gid = self.gid, me = self.me, %err, "discarding broken snapshot");
                return;
            }
        };
        let mut st = self.state.lock().await;
        st.applied_index = index;
        st.tbl = persisted.tbl;
        st.client_tbl = persisted.client_tbl;
        st.client_id = persisted.client_id;
        st.op_id = persisted.op_id;
        // Log positions the pending proposals were registered under are no
        // longer meaningful; their clients must retry.
        for (_, entry) in st.command_tbl.drain() {
            let _ = entry.reply_tx.send(Err(KvError::WrongLeader));
        }
        tracing::info!(gid = self.gid, me = self.me, index, "installed snapshot");
    }

    /// Adopt a committed config update. This is the only place `config`
    /// changes. Returns the outgoing shard batches to trigger (leader only,
    /// and only for non-initial transitions).
    async fn apply_reconfigure(&self, index: u64, new: Config) -> Vec<(GroupId, MigrateOut)> {
        let mut st = self.state.lock().await;
        st.applied_index = index;
        let mut outgoing = Vec::new();
        if new.num > st.config.num {
            let old = std::mem::replace(&mut st.config, new);
            tracing::info!(
                gid = self.gid,
                me = self.me,
                from = old.num,
                to = st.config.num,
                "adopted shard config"
            );
            if old.num > 0 {
                let by_group = outgoing_by_group(self.gid, &old, &st.config, &st.tbl);
                // Handed-off keys leave the table on every replica, strictly
                // after the outgoing batches captured them.
                let shards = st.config.shards;
                st.tbl.retain(|key, _| shards[shard_of(key)] == self.gid);
                if self.raft.state().await.is_leader {
                    outgoing = by_group;
                }
            }
        }
        // A registered proposal at this index was preempted by the config
        // entry; its client retries elsewhere.
        if let Some(entry) = st.command_tbl.remove(&index) {
            let _ = entry.reply_tx.send(Err(KvError::WrongLeader));
        }
        outgoing
    }

    /// Apply one committed client-attributed request.
    async fn apply_request(&self, index: u64, req: RequestOp) {
        let mut st = self.state.lock().await;
        st.applied_index = index;

        let duplicate = st
            .client_tbl
            .get(&req.client_id)
            .filter(|cached| cached.op_id >= req.op_id)
            .map(|cached| cached.reply.clone());
        let reply = match duplicate {
            // Retried op: serve the recorded outcome, touch nothing.
            Some(reply) => reply,
            None => {
                let reply = self.execute(&mut st, &req.kind);
                st.client_tbl
                    .insert(req.client_id, CachedReply { op_id: req.op_id, reply: reply.clone() });
                reply
            }
        };

        if let Some(entry) = st.command_tbl.remove(&index) {
            // A different (client, op) at this index means leadership moved
            // after the registered proposal; tell that client to retry.
            let matches = entry.client_id == req.client_id && entry.op_id == req.op_id;
            let _ = entry.reply_tx.send(if matches { reply } else { Err(KvError::WrongLeader) });
        }
    }

    fn execute(&self, st: &mut ServerState, kind: &RequestKind) -> Result<String, KvError> {
        let owned = |st: &ServerState, key: &str| {
            st.config.num > 0 && st.config.shards[shard_of(key)] == self.gid
        };
        match kind {
            RequestKind::Get { key } => {
                // The front-end check was advisory; ownership is decided
                // here, under the config in effect at this log position.
                if !owned(st, key) {
                    return Err(KvError::WrongGroup);
                }
                Ok(st.tbl.get(key).cloned().unwrap_or_default())
            }
            RequestKind::Put { key, value } => {
                if !owned(st, key) {
                    return Err(KvError::WrongGroup);
                }
                st.tbl.insert(key.clone(), value.clone());
                Ok(String::new())
            }
            RequestKind::Append { key, value } => {
                if !owned(st, key) {
                    return Err(KvError::WrongGroup);
                }
                st.tbl.entry(key.clone()).or_default().push_str(value);
                Ok(String::new())
            }
            RequestKind::InstallShards { config_num, data, .. } => {
                if st.config.num > *config_num {
                    // The push raced a newer config; the sender's own plan
                    // for that config covers this data.
                    return Err(KvError::OutdatedConfig);
                }
                // Ownership of incoming shards is disjoint from what this
                // group already holds, so plain inserts are safe.
                for (key, value) in data {
                    st.tbl.insert(key.clone(), value.clone());
                }
                Ok(String::new())
            }
        }
    }
}
