use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use ygg_types::{AckReply, GetArgs, GetReply, MigrateArgs, PutAppendArgs};

use crate::Transport;

/// One inbound RPC, paired with its single-shot reply channel.
#[derive(Debug)]
pub enum RpcRequest {
    Get(GetArgs, oneshot::Sender<GetReply>),
    PutAppend(PutAppendArgs, oneshot::Sender<AckReply>),
    MigrateShards(MigrateArgs, oneshot::Sender<AckReply>),
}

/// In-process transport: a shared name → inbox registry.
///
/// Callers see a missing or unbound name as a network failure (`None`), so
/// tests simulate partitions and crashes by unbinding names. Intended for
/// tests and demo wiring.
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RpcRequest>>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a fresh inbox, replacing any previous binding (a
    /// restarted server reclaims its name).
    pub fn bind(&self, name: &str) -> mpsc::UnboundedReceiver<RpcRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().insert(name.to_string(), tx);
        rx
    }

    /// Drop `name` from the registry; subsequent calls to it fail.
    pub fn disconnect(&self, name: &str) {
        self.inner.lock().unwrap().remove(name);
    }

    fn inbox(&self, name: &str) -> Option<mpsc::UnboundedSender<RpcRequest>> {
        self.inner.lock().unwrap().get(name).cloned()
    }
}

impl Transport for MemNetwork {
    async fn get(&self, server: &str, args: GetArgs) -> Option<GetReply> {
        let (tx, rx) = oneshot::channel();
        self.inbox(server)?.send(RpcRequest::Get(args, tx)).ok()?;
        rx.await.ok()
    }

    async fn put_append(&self, server: &str, args: PutAppendArgs) -> Option<AckReply> {
        let (tx, rx) = oneshot::channel();
        self.inbox(server)?.send(RpcRequest::PutAppend(args, tx)).ok()?;
        rx.await.ok()
    }

    async fn migrate_shards(&self, server: &str, args: MigrateArgs) -> Option<AckReply> {
        let (tx, rx) = oneshot::channel();
        self.inbox(server)?.send(RpcRequest::MigrateShards(args, tx)).ok()?;
        rx.await.ok()
    }
}
