use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::time;

use ygg_consensus::ReplicatedLog;
use ygg_ctrl::ControllerClient;
use ygg_net::mem::RpcRequest;
use ygg_net::Transport;
use ygg_types::{
    shard_of, AckReply, ClientId, Config, GetArgs, GetReply, GroupId, KvError, MigrateArgs, Op,
    OpId, PutAppendArgs, RequestKind, RequestOp, WriteKind,
};

use crate::migrate::MigrateEntry;

/// While waiting for an applied reply, a front-end handler re-reads the
/// engine's term at this interval; a term change means the proposal was
/// preempted.
pub(crate) const TERM_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Base interval between snapshot-size checks; the snapshotter sleeps a
/// fraction of it proportional to remaining headroom.
pub(crate) const SNAPSHOT_CHECK_INTERVAL_MS: u64 = 100;
/// Snapshot once the persisted log reaches this fraction of the budget.
pub(crate) const SNAPSHOT_THRESHOLD_RATIO: f64 = 0.9;
/// The applier nudges the snapshotter after this many applied commands.
pub(crate) const SNAPSHOT_OPS_INTERVAL: u64 = 50;
/// Poll cadence of the config fetcher when nothing triggers it sooner.
pub(crate) const CONFIG_REFRESH_INTERVAL: Duration = Duration::from_millis(100);
/// Backoff used by shard senders between delivery attempts.
pub(crate) const MIGRATE_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// A cached per-client operation outcome, used for at-most-once dedup.
/// Persisted in snapshots.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct CachedReply {
    pub op_id: OpId,
    pub reply: Result<String, KvError>,
}

/// Rendezvous between a front-end handler and the applier, keyed by log
/// index. Leader-only and volatile.
pub(crate) struct CommandEntry {
    pub client_id: ClientId,
    pub op_id: OpId,
    pub reply_tx: oneshot::Sender<Result<String, KvError>>,
}

/// Everything behind the server mutex. The applier task is the only writer
/// of `config`, `tbl`, `client_tbl` and `applied_index`.
pub(crate) struct ServerState {
    pub config: Config,
    pub tbl: BTreeMap<String, String>,
    pub client_tbl: BTreeMap<ClientId, CachedReply>,
    pub command_tbl: HashMap<u64, CommandEntry>,
    pub migrate_tbl: HashMap<GroupId, MigrateEntry>,
    pub applied_index: u64,
    /// This replica's client identity when pushing shards to other groups.
    /// Persisted so retried pushes dedupe across restarts.
    pub client_id: ClientId,
    pub op_id: OpId,
}

impl ServerState {
    fn new() -> Self {
        ServerState {
            config: Config::default(),
            tbl: BTreeMap::new(),
            client_tbl: BTreeMap::new(),
            command_tbl: HashMap::new(),
            migrate_tbl: HashMap::new(),
            applied_index: 0,
            client_id: rand::thread_rng().gen_range(1..u64::MAX),
            op_id: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(client_id: ClientId) -> Self {
        let mut st = Self::new();
        st.client_id = client_id;
        st
    }
}

/// One replica of a sharded key-value group.
pub struct ShardServer<R, C, T> {
    pub(crate) gid: GroupId,
    pub(crate) me: usize,
    pub(crate) raft: Arc<R>,
    pub(crate) ctrl: C,
    pub(crate) net: T,
    pub(crate) max_log_bytes: Option<u64>,
    pub(crate) state: Mutex<ServerState>,
    pub(crate) fetch_tx: mpsc::Sender<()>,
    pub(crate) snap_tx: mpsc::Sender<()>,
    pub(crate) quit_tx: watch::Sender<bool>,
    killed: AtomicBool,
}

impl<R, C, T> ShardServer<R, C, T>
where
    R: ReplicatedLog,
    C: ControllerClient,
    T: Transport,
{
    /// Spawn a replica on top of its consensus handle and apply stream.
    ///
    /// `max_log_bytes` is the persisted-log budget that drives snapshots;
    /// `None` disables them. Returns immediately; all long-running work
    /// happens on spawned tasks.
    pub fn start(
        raft: Arc<R>,
        apply_rx: mpsc::UnboundedReceiver<ygg_consensus::ApplyMsg>,
        ctrl: C,
        net: T,
        gid: GroupId,
        me: usize,
        max_log_bytes: Option<u64>,
    ) -> Arc<Self> {
        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let (snap_tx, snap_rx) = mpsc::channel(1);
        let (quit_tx, _) = watch::channel(false);
        let server = Arc::new(ShardServer {
            gid,
            me,
            raft,
            ctrl,
            net,
            max_log_bytes,
            state: Mutex::new(ServerState::new()),
            fetch_tx,
            snap_tx,
            quit_tx,
            killed: AtomicBool::new(false),
        });

        tokio::spawn(server.clone().applier(apply_rx));
        // Fetch the current config right away instead of waiting a tick.
        let _ = server.fetch_tx.try_send(());
        tokio::spawn(server.clone().config_fetcher(fetch_rx));
        tokio::spawn(server.clone().snapshotter(snap_rx));
        server
    }

    /// Dispatch inbound transport requests to the handlers, one task per
    /// in-flight RPC.
    pub fn serve(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<RpcRequest>) {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(request) = inbox.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    match request {
                        RpcRequest::Get(args, reply) => {
                            let _ = reply.send(server.get(args).await);
                        }
                        RpcRequest::PutAppend(args, reply) => {
                            let _ = reply.send(server.put_append(args).await);
                        }
                        RpcRequest::MigrateShards(args, reply) => {
                            let _ = reply.send(server.migrate_shards(args).await);
                        }
                    }
                });
            }
        });
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        // Killing the engine closes the apply stream; the applier then
        // resolves every pending front-end wait with Shutdown.
        self.raft.kill();
        let _ = self.quit_tx.send(true);
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    pub(crate) fn kick_config_fetch(&self) {
        let _ = self.fetch_tx.try_send(());
    }

    pub async fn get(&self, args: GetArgs) -> GetReply {
        if self.killed() {
            return Err(KvError::Shutdown);
        }
        let st = self.state.lock().await;
        if st.config.num == 0 || st.config.shards[shard_of(&args.key)] != self.gid {
            return Err(KvError::WrongGroup);
        }
        let op = RequestOp {
            client_id: args.client_id,
            op_id: args.op_id,
            kind: RequestKind::Get { key: args.key },
        };
        self.submit(st, args.config_num, op).await
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> AckReply {
        if self.killed() {
            return Err(KvError::Shutdown);
        }
        let st = self.state.lock().await;
        if st.config.num == 0 || st.config.shards[shard_of(&args.key)] != self.gid {
            return Err(KvError::WrongGroup);
        }
        let kind = match args.kind {
            WriteKind::Put => RequestKind::Put { key: args.key, value: args.value },
            WriteKind::Append => RequestKind::Append { key: args.key, value: args.value },
        };
        let op = RequestOp { client_id: args.client_id, op_id: args.op_id, kind };
        self.submit(st, args.config_num, op).await.map(|_| ())
    }

    /// Shard push from a previous owner group. No shard-ownership precheck;
    /// the gate is strictly config-number equality.
    pub async fn migrate_shards(&self, args: MigrateArgs) -> AckReply {
        if self.killed() {
            return Err(KvError::Shutdown);
        }
        let st = self.state.lock().await;
        tracing::debug!(
            gid = self.gid,
            me = self.me,
            local = st.config.num,
            pushed = args.config_num,
            shards = ?args.shards,
            "shard push received"
        );
        let op = RequestOp {
            client_id: args.client_id,
            op_id: args.op_id,
            kind: RequestKind::InstallShards {
                config_num: args.config_num,
                shards: args.shards,
                data: args.data,
            },
        };
        self.submit(st, args.config_num, op).await.map(|_| ())
    }

    /// Common handler tail: config-freshness gate, proposal, and the wait
    /// for the applied result. Takes the state guard locked by the caller
    /// and releases it before waiting.
    async fn submit(
        &self,
        mut st: MutexGuard<'_, ServerState>,
        request_config_num: u64,
        op: RequestOp,
    ) -> Result<String, KvError> {
        if !self.raft.state().await.is_leader {
            // Only the leader vets the request's config number and proposes.
            return Err(KvError::WrongLeader);
        }
        if st.config.num < request_config_num {
            // A config from the future: get the fetcher moving and have the
            // caller retry once we catch up.
            drop(st);
            self.kick_config_fetch();
            return Err(KvError::UnknownConfig);
        }
        if st.config.num > request_config_num {
            return Err(KvError::OutdatedConfig);
        }

        let (client_id, op_id) = (op.client_id, op.op_id);
        let kind = op.kind.to_string();
        let Some(proposal) = self.raft.start(Op::Request(op)).await else {
            return Err(KvError::WrongLeader);
        };
        tracing::debug!(
            gid = self.gid,
            me = self.me,
            index = proposal.index,
            %kind,
            client = client_id % 100,
            op = op_id,
            "proposed"
        );
        let (reply_tx, mut reply_rx) = oneshot::channel();
        st.command_tbl.insert(proposal.index, CommandEntry { client_id, op_id, reply_tx });
        drop(st);

        let mut poll = time::interval(TERM_POLL_INTERVAL);
        poll.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                applied = &mut reply_rx => {
                    // A closed channel means the applier tore down while we
                    // waited: the replica is gone.
                    return applied.unwrap_or(Err(KvError::Shutdown));
                }
                _ = poll.tick() => {
                    if self.killed() {
                        return Err(KvError::Shutdown);
                    }
                    if self.raft.state().await.term != proposal.term {
                        self.state.lock().await.command_tbl.remove(&proposal.index);
                        return Err(KvError::WrongLeader);
                    }
                }
            }
        }
    }
}
