//! Consumed interface of the RPC transport.
//!
//! Replicas and clients address each other by the server names the
//! controller hands out in `Config::groups`; the transport resolves a name
//! to a callable endpoint per request. `None` replies model network
//! failure (unreachable server, dropped connection) and are
//! indistinguishable from a crashed peer, which is exactly how callers must
//! treat them.

pub mod mem;

use std::future::Future;

use ygg_types::{AckReply, GetArgs, GetReply, MigrateArgs, PutAppendArgs};

pub trait Transport: Send + Sync + 'static {
    fn get(&self, server: &str, args: GetArgs)
        -> impl Future<Output = Option<GetReply>> + Send;

    fn put_append(&self, server: &str, args: PutAppendArgs)
        -> impl Future<Output = Option<AckReply>> + Send;

    fn migrate_shards(&self, server: &str, args: MigrateArgs)
        -> impl Future<Output = Option<AckReply>> + Send;
}
