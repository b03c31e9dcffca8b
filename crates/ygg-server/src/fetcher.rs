use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time;

use ygg_consensus::ReplicatedLog;
use ygg_ctrl::ControllerClient;
use ygg_net::Transport;
use ygg_types::Op;

use crate::server::{ShardServer, CONFIG_REFRESH_INTERVAL};

impl<R, C, T> ShardServer<R, C, T>
where
    R: ReplicatedLog,
    C: ControllerClient,
    T: Transport,
{
    /// Poll the controller on a timer or when kicked; the leader proposes
    /// any newer config through the log so the transition itself is a
    /// committed entry and every replica adopts it at the same position.
    pub(crate) async fn config_fetcher(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        let mut quit = self.quit_tx.subscribe();
        while !self.killed() {
            tokio::select! {
                kicked = trigger.recv() => {
                    if kicked.is_none() {
                        return;
                    }
                }
                _ = time::sleep(CONFIG_REFRESH_INTERVAL) => {}
                _ = quit.changed() => return,
            }
            if !self.raft.state().await.is_leader {
                continue;
            }
            let Some(latest) = self.ctrl.query(None).await else {
                continue;
            };
            let st = self.state.lock().await;
            if latest.num > st.config.num {
                tracing::info!(
                    gid = self.gid,
                    me = self.me,
                    have = st.config.num,
                    fetched = latest.num,
                    "proposing config update"
                );
                let _ = self.raft.start(Op::Reconfigure(latest)).await;
            }
        }
    }
}
