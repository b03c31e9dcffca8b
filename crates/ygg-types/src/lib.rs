use std::collections::BTreeMap;
use std::fmt;

pub type GroupId = u64;
pub type ClientId = u64;
pub type OpId = u64;

/// Number of key shards. Fixed for the lifetime of a cluster; the controller
/// only ever reassigns shard *ownership*, never the shard count.
pub const N_SHARDS: usize = 10;

/// Stable key → shard mapping. Every replica, client, and controller must
/// agree on this function.
pub fn shard_of(key: &str) -> usize {
    key.as_bytes().first().map_or(0, |b| *b as usize % N_SHARDS)
}

/// A versioned assignment of shards to replication groups.
///
/// `num == 0` is the pre-assignment state: no group owns anything and every
/// request is rejected with [`KvError::WrongGroup`] until the controller
/// publishes config 1.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub num: u64,
    /// shard → owning group id; `0` means unassigned.
    pub shards: [GroupId; N_SHARDS],
    /// group id → server names, resolvable through the transport.
    pub groups: BTreeMap<GroupId, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Config { num: 0, shards: [0; N_SHARDS], groups: BTreeMap::new() }
    }
}

impl Config {
    /// Shards assigned to `gid` under this config.
    pub fn shards_of(&self, gid: GroupId) -> Vec<usize> {
        (0..N_SHARDS).filter(|&s| self.shards[s] == gid).collect()
    }
}

/// Closed error set returned by every replica RPC.
///
/// These are protocol outcomes, not faults: each variant tells the caller
/// what to do next (rotate servers, refresh its config, back off, or give
/// up on this replica). Cached operation results embed them, so the enum is
/// `Clone + Serialize` and survives snapshots.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
pub enum KvError {
    #[error("not the leader")]
    WrongLeader,
    #[error("shard not served by this group")]
    WrongGroup,
    #[error("request config newer than local config")]
    UnknownConfig,
    #[error("request config older than local config")]
    OutdatedConfig,
    #[error("replica shut down")]
    Shutdown,
}

/// An entry proposed to the replicated log.
///
/// Client-attributed requests carry the `(client_id, op_id)` pair used for
/// at-most-once dedup; config updates are internal and carry neither.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Op {
    Request(RequestOp),
    Reconfigure(Config),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RequestOp {
    pub client_id: ClientId,
    pub op_id: OpId,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RequestKind {
    Get {
        key: String,
    },
    Put {
        key: String,
        value: String,
    },
    Append {
        key: String,
        value: String,
    },
    /// Shard data pushed by the previous owner group on reconfiguration.
    /// `client_id` on the carrying [`RequestOp`] is the *sender group's*
    /// migration identity, so retried pushes dedupe like any client op.
    InstallShards {
        config_num: u64,
        shards: Vec<usize>,
        data: BTreeMap<String, String>,
    },
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Get { key } => write!(f, "G{key}"),
            RequestKind::Put { key, .. } => write!(f, "P{key}"),
            RequestKind::Append { key, .. } => write!(f, "A{key}"),
            RequestKind::InstallShards { config_num, shards, .. } => {
                write!(f, "M{config_num}:{shards:?}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RPC surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub config_num: u64,
    pub client_id: ClientId,
    pub op_id: OpId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WriteKind {
    Put,
    Append,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub kind: WriteKind,
    pub config_num: u64,
    pub client_id: ClientId,
    pub op_id: OpId,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrateArgs {
    pub config_num: u64,
    pub shards: Vec<usize>,
    pub data: BTreeMap<String, String>,
    pub client_id: ClientId,
    pub op_id: OpId,
}

/// `Get` reply; a missing key reads as the empty string.
pub type GetReply = Result<String, KvError>;
/// Reply for `PutAppend` and `MigrateShards`.
pub type AckReply = Result<(), KvError>;
