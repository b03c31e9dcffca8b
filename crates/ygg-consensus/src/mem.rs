use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use ygg_types::Op;

use crate::{ApplyMsg, LeaderState, Proposal, ReplicatedLog};

fn encoded_len(op: &Op) -> u64 {
    bincode::serde::encode_to_vec(op, bincode::config::standard())
        .map(|b| b.len() as u64)
        .unwrap_or(0)
}

struct Entry {
    op: Op,
    bytes: u64,
}

struct SnapshotBlob {
    index: u64,
    term: u64,
    data: Vec<u8>,
}

struct Inner {
    term: u64,
    /// Designated leader replica. There are no elections; tests and the demo
    /// node move leadership explicitly with [`MemCluster::set_leader`].
    leader: Option<usize>,
    /// Index of the last entry folded into `snapshot`; `log[k]` holds index
    /// `last_included + 1 + k`.
    last_included: u64,
    snapshot: Option<SnapshotBlob>,
    log: Vec<Entry>,
    /// Proposed but not yet committed. Drained immediately unless paused;
    /// discarded wholesale when leadership moves.
    pending: Vec<Op>,
    paused: bool,
    log_bytes: u64,
    links: Vec<Option<mpsc::UnboundedSender<ApplyMsg>>>,
}

impl Inner {
    fn next_index(&self) -> u64 {
        self.last_included + self.log.len() as u64 + self.pending.len() as u64 + 1
    }

    fn commit_pending(&mut self) {
        for op in std::mem::take(&mut self.pending) {
            let index = self.last_included + self.log.len() as u64 + 1;
            let bytes = encoded_len(&op);
            for link in self.links.iter().flatten() {
                let _ = link.send(ApplyMsg::Command { index, op: op.clone() });
            }
            self.log.push(Entry { op, bytes });
            self.log_bytes += bytes;
        }
    }
}

/// In-process replicated log shared by the replicas of one group.
///
/// A perfect single-leader consensus: the designated leader's proposals
/// commit instantly (unless paused) and fan out to every attached replica's
/// apply stream in order. Supports the full surface the store core consumes,
/// including snapshot-based truncation and restart with snapshot + tail
/// replay. Intended for tests and in-process wiring; nothing is persisted.
#[derive(Clone)]
pub struct MemCluster {
    inner: Arc<Mutex<Inner>>,
}

impl MemCluster {
    pub fn new(replicas: usize) -> Self {
        MemCluster {
            inner: Arc::new(Mutex::new(Inner {
                term: 1,
                leader: None,
                last_included: 0,
                snapshot: None,
                log: Vec::new(),
                pending: Vec::new(),
                paused: false,
                log_bytes: 0,
                links: (0..replicas).map(|_| None).collect(),
            })),
        }
    }

    /// Attach replica `me` to the cluster, replaying the stored snapshot and
    /// the retained log tail into a fresh apply stream. Used both for the
    /// initial spawn and for restart-after-crash.
    pub fn attach(&self, me: usize) -> (Arc<MemLog>, mpsc::UnboundedReceiver<ApplyMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        if let Some(snap) = &inner.snapshot {
            let _ = tx.send(ApplyMsg::Snapshot {
                index: snap.index,
                term: snap.term,
                data: snap.data.clone(),
            });
        }
        for (k, entry) in inner.log.iter().enumerate() {
            let _ = tx.send(ApplyMsg::Command {
                index: inner.last_included + 1 + k as u64,
                op: entry.op.clone(),
            });
        }
        inner.links[me] = Some(tx);
        let log = Arc::new(MemLog {
            cluster: self.clone(),
            me,
            killed: AtomicBool::new(false),
        });
        (log, rx)
    }

    /// Move leadership to `me`, bumping the term. Uncommitted proposals of
    /// the previous leader are discarded, so their indexes are reassigned to
    /// the new leader's entries.
    pub fn set_leader(&self, me: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.term += 1;
        inner.leader = Some(me);
        inner.pending.clear();
    }

    /// Hold proposals uncommitted until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.paused = false;
        inner.commit_pending();
    }

    /// Index of the last entry compacted into the stored snapshot.
    pub fn last_included(&self) -> u64 {
        self.inner.lock().unwrap().last_included
    }
}

/// One replica's handle into a [`MemCluster`].
pub struct MemLog {
    cluster: MemCluster,
    me: usize,
    killed: AtomicBool,
}

impl ReplicatedLog for MemLog {
    async fn start(&self, op: Op) -> Option<Proposal> {
        if self.killed.load(Ordering::Relaxed) {
            return None;
        }
        let mut inner = self.cluster.inner.lock().unwrap();
        if inner.leader != Some(self.me) {
            return None;
        }
        let proposal = Proposal { index: inner.next_index(), term: inner.term };
        inner.pending.push(op);
        if !inner.paused {
            inner.commit_pending();
        }
        Some(proposal)
    }

    async fn state(&self) -> LeaderState {
        let inner = self.cluster.inner.lock().unwrap();
        LeaderState {
            term: inner.term,
            is_leader: inner.leader == Some(self.me) && !self.killed.load(Ordering::Relaxed),
        }
    }

    async fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut inner = self.cluster.inner.lock().unwrap();
        if index <= inner.last_included {
            return;
        }
        // Only applied (hence committed) prefixes may be snapshotted.
        let drop_count = (index - inner.last_included) as usize;
        assert!(drop_count <= inner.log.len(), "snapshot beyond committed log");
        let dropped: u64 = inner.log.drain(..drop_count).map(|e| e.bytes).sum();
        inner.log_bytes -= dropped;
        let term = inner.term;
        inner.snapshot = Some(SnapshotBlob { index, term, data });
        inner.last_included = index;
    }

    async fn last_included_index(&self) -> u64 {
        self.cluster.inner.lock().unwrap().last_included
    }

    async fn log_bytes(&self) -> u64 {
        self.cluster.inner.lock().unwrap().log_bytes
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        let mut inner = self.cluster.inner.lock().unwrap();
        // Dropping the link closes this replica's apply stream.
        inner.links[self.me] = None;
        if inner.leader == Some(self.me) {
            inner.leader = None;
            inner.pending.clear();
        }
    }
}
