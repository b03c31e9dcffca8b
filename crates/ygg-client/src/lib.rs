//! Retrying client for the sharded key-value store.
//!
//! A [`Clerk`] routes each key to the owning group under its cached shard
//! config and walks the group's servers until one accepts. Every reply in
//! the closed error set maps to a concrete next step: rotate servers on
//! `WrongLeader`/`Shutdown`/network failure, refresh the config on
//! `WrongGroup`/`OutdatedConfig`, and back off in place on `UnknownConfig`.
//! Operations retry until they succeed, so a caller only gets an answer
//! that actually committed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time;

use ygg_ctrl::ControllerClient;
use ygg_net::Transport;
use ygg_types::{shard_of, ClientId, Config, GetArgs, GroupId, KvError, PutAppendArgs, WriteKind};

const RETRY_PAUSE: Duration = Duration::from_millis(50);

struct ClerkCache {
    config: Config,
    /// Per group, the server that last accepted a request.
    leader_hints: HashMap<GroupId, usize>,
}

pub struct Clerk<C, T> {
    ctrl: C,
    net: T,
    client_id: ClientId,
    next_op_id: AtomicU64,
    cache: Mutex<ClerkCache>,
}

impl<C, T> Clerk<C, T>
where
    C: ControllerClient,
    T: Transport,
{
    pub fn new(ctrl: C, net: T) -> Self {
        Clerk {
            ctrl,
            net,
            client_id: rand::thread_rng().gen_range(1..u64::MAX),
            next_op_id: AtomicU64::new(1),
            cache: Mutex::new(ClerkCache {
                config: Config::default(),
                leader_hints: HashMap::new(),
            }),
        }
    }

    /// Read a key; a key nobody has written reads as the empty string.
    pub async fn get(&self, key: &str) -> String {
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        loop {
            let Some(route) = self.route(key) else {
                self.refresh_config().await;
                time::sleep(RETRY_PAUSE).await;
                continue;
            };
            let n = route.servers.len();
            let mut server_id = route.hint % n;
            let mut tried = 0;
            while tried < n {
                let args = GetArgs {
                    key: key.to_string(),
                    config_num: route.config_num,
                    client_id: self.client_id,
                    op_id,
                };
                match self.net.get(&route.servers[server_id], args).await {
                    Some(Ok(value)) => {
                        self.remember_leader(route.gid, server_id);
                        return value;
                    }
                    other => {
                        if self.handle_retry(&route, &mut server_id, &mut tried, other.map(|r| r.map(|_| ()))).await {
                            break;
                        }
                    }
                }
            }
            time::sleep(RETRY_PAUSE).await;
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.put_append(key, value, WriteKind::Put).await;
    }

    pub async fn append(&self, key: &str, value: &str) {
        self.put_append(key, value, WriteKind::Append).await;
    }

    async fn put_append(&self, key: &str, value: &str, kind: WriteKind) {
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        loop {
            let Some(route) = self.route(key) else {
                self.refresh_config().await;
                time::sleep(RETRY_PAUSE).await;
                continue;
            };
            let n = route.servers.len();
            let mut server_id = route.hint % n;
            let mut tried = 0;
            while tried < n {
                let args = PutAppendArgs {
                    key: key.to_string(),
                    value: value.to_string(),
                    kind,
                    config_num: route.config_num,
                    client_id: self.client_id,
                    op_id,
                };
                match self.net.put_append(&route.servers[server_id], args).await {
                    Some(Ok(())) => {
                        self.remember_leader(route.gid, server_id);
                        return;
                    }
                    other => {
                        if self.handle_retry(&route, &mut server_id, &mut tried, other).await {
                            break;
                        }
                    }
                }
            }
            time::sleep(RETRY_PAUSE).await;
        }
    }

    /// Shared failure handling for one server attempt. Returns `true` when
    /// the caller should abandon this group pass and re-route.
    async fn handle_retry(
        &self,
        route: &Route,
        server_id: &mut usize,
        tried: &mut usize,
        reply: Option<Result<(), KvError>>,
    ) -> bool {
        let n = route.servers.len();
        match reply {
            None | Some(Err(KvError::WrongLeader)) | Some(Err(KvError::Shutdown)) => {
                *server_id = (*server_id + 1) % n;
                *tried += 1;
                false
            }
            Some(Err(KvError::WrongGroup)) => {
                self.refresh_config().await;
                true
            }
            Some(Err(KvError::OutdatedConfig)) => {
                self.remember_leader(route.gid, *server_id);
                self.refresh_config().await;
                true
            }
            Some(Err(KvError::UnknownConfig)) => {
                // The replica is behind our config; it will catch up.
                self.remember_leader(route.gid, *server_id);
                time::sleep(RETRY_PAUSE).await;
                false
            }
            // Successes are handled by the callers before they get here.
            Some(Ok(())) => true,
        }
    }

    fn route(&self, key: &str) -> Option<Route> {
        let cache = self.cache.lock().unwrap();
        let config = &cache.config;
        if config.num == 0 {
            return None;
        }
        let gid = config.shards[shard_of(key)];
        if gid == 0 {
            return None;
        }
        let servers = config.groups.get(&gid).cloned()?;
        if servers.is_empty() {
            return None;
        }
        let hint = cache.leader_hints.get(&gid).copied().unwrap_or(0);
        Some(Route { config_num: config.num, gid, servers, hint })
    }

    async fn refresh_config(&self) {
        if let Some(latest) = self.ctrl.query(None).await {
            let mut cache = self.cache.lock().unwrap();
            if latest.num > cache.config.num {
                tracing::debug!(from = cache.config.num, to = latest.num, "clerk refreshed config");
                cache.config = latest;
            }
        }
    }

    fn remember_leader(&self, gid: GroupId, server_id: usize) {
        self.cache.lock().unwrap().leader_hints.insert(gid, server_id);
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
}

struct Route {
    config_num: u64,
    gid: GroupId,
    servers: Vec<String>,
    hint: usize,
}
