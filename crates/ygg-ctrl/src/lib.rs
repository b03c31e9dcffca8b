//! Consumed interface of the external shard controller.
//!
//! The controller owns the assignment of shards to replication groups and
//! publishes it as a monotonically numbered sequence of [`Config`]s. The
//! store core only ever asks it for configs; join/leave/rebalance policy is
//! the controller's business.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use ygg_types::{Config, GroupId, N_SHARDS};

pub trait ControllerClient: Send + Sync + 'static {
    /// Fetch config number `num`, or the latest when `None`. Returns `None`
    /// if the controller did not answer.
    fn query(&self, num: Option<u64>) -> impl Future<Output = Option<Config>> + Send;
}

/// In-process controller serving a dense version history of configs.
///
/// Config 0 (no assignment) is always present; [`publish`](Self::publish)
/// appends the next numbered config. Intended for tests and demo wiring.
#[derive(Clone)]
pub struct MemController {
    history: Arc<Mutex<Vec<Config>>>,
}

impl MemController {
    pub fn new() -> Self {
        MemController { history: Arc::new(Mutex::new(vec![Config::default()])) }
    }

    /// Publish the next config with the given assignment and membership.
    /// Returns its number.
    pub fn publish(
        &self,
        shards: [GroupId; N_SHARDS],
        groups: BTreeMap<GroupId, Vec<String>>,
    ) -> u64 {
        let mut history = self.history.lock().unwrap();
        let num = history.len() as u64;
        history.push(Config { num, shards, groups });
        num
    }

    pub fn latest_num(&self) -> u64 {
        self.history.lock().unwrap().last().map(|c| c.num).unwrap_or(0)
    }
}

impl Default for MemController {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerClient for MemController {
    async fn query(&self, num: Option<u64>) -> Option<Config> {
        let history = self.history.lock().unwrap();
        match num {
            None => history.last().cloned(),
            Some(n) => history.get(n as usize).cloned(),
        }
    }
}
