use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use ygg_consensus::ReplicatedLog;
use ygg_ctrl::ControllerClient;
use ygg_net::Transport;
use ygg_types::{ClientId, OpId};

use crate::server::{
    CachedReply, ServerState, ShardServer, SNAPSHOT_CHECK_INTERVAL_MS, SNAPSHOT_THRESHOLD_RATIO,
};

/// Snapshot payload. The config is deliberately absent: a recovering
/// replica re-learns it from the log entries after the snapshot point and
/// from the controller.
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct PersistedState {
    pub tbl: BTreeMap<String, String>,
    pub client_tbl: BTreeMap<ClientId, CachedReply>,
    pub client_id: ClientId,
    pub op_id: OpId,
}

/// Borrowed mirror of [`PersistedState`] so encoding does not clone the
/// tables. Field order must match.
#[derive(serde::Serialize)]
struct PersistedView<'a> {
    tbl: &'a BTreeMap<String, String>,
    client_tbl: &'a BTreeMap<ClientId, CachedReply>,
    client_id: ClientId,
    op_id: OpId,
}

pub(crate) fn encode_state(st: &ServerState) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(
        &PersistedView {
            tbl: &st.tbl,
            client_tbl: &st.client_tbl,
            client_id: st.client_id,
            op_id: st.op_id,
        },
        bincode::config::standard(),
    )
}

pub(crate) fn decode_state(bytes: &[u8]) -> Result<PersistedState, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map(|(state, _)| state)
}

impl<R, C, T> ShardServer<R, C, T>
where
    R: ReplicatedLog,
    C: ControllerClient,
    T: Transport,
{
    /// Watch the persisted-log size and snapshot when it nears the budget.
    /// Sleeps shorter as the log grows, and wakes early when the applier
    /// signals a burst of applied commands.
    pub(crate) async fn snapshotter(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        let Some(max_log_bytes) = self.max_log_bytes else {
            return;
        };
        let mut quit = self.quit_tx.subscribe();
        while !self.killed() {
            let mut ratio = self.raft.log_bytes().await as f64 / max_log_bytes as f64;
            if ratio > SNAPSHOT_THRESHOLD_RATIO {
                let st = self.state.lock().await;
                match encode_state(&st) {
                    Ok(data) => {
                        tracing::debug!(
                            gid = self.gid,
                            me = self.me,
                            index = st.applied_index,
                            bytes = data.len(),
                            "taking snapshot"
                        );
                        self.raft.snapshot(st.applied_index, data).await;
                    }
                    Err(err) => {
                        tracing::error!(gid = self.gid, me = self.me, %err, "snapshot encoding failed");
                    }
                }
                drop(st);
                ratio = 0.0;
            }
            let pause = (1.0 - ratio).max(0.0) * SNAPSHOT_CHECK_INTERVAL_MS as f64;
            tokio::select! {
                _ = time::sleep(Duration::from_millis(pause as u64)) => {}
                _ = trigger.recv() => {}
                _ = quit.changed() => return,
            }
        }
    }
}
