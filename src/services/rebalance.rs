//! Replica placement for objects on evacuated or unknown storage nodes.
//!
//! Each replica on a node that is being evacuated, or that is missing from
//! the inventory, gets a replacement chosen among healthy nodes that do not
//! already hold the object. Datacenters the object does not yet live in are
//! preferred; the rest is ordered by md5 of `objectId:storageId`, which
//! spreads load across nodes and keeps the plan stable between runs.

use crate::models::storage::RebalanceRow;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    str::FromStr,
};
use tracing::{debug, warn};

/// A storage node and the datacenter it lives in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageNode {
    pub storage_id: String,
    pub datacenter: String,
}

impl FromStr for StorageNode {
    type Err = String;

    /// Parses `storageId@datacenter`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().rsplit_once('@') {
            Some((storage_id, datacenter)) if !storage_id.is_empty() && !datacenter.is_empty() => {
                Ok(Self {
                    storage_id: storage_id.to_string(),
                    datacenter: datacenter.to_string(),
                })
            }
            _ => Err(format!("expected `storageId@datacenter`, got `{}`", raw)),
        }
    }
}

/// Copy `object_id` from `from` to `to`, then repoint its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebalanceAction {
    pub object_id: String,
    pub owner: String,
    pub from: String,
    pub to: String,
    pub shard: String,
    pub key: String,
}

impl fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rebalance\t{}\t{}\t{}\t{}\t{}\t{}",
            self.object_id, self.owner, self.from, self.to, self.shard, self.key
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceStats {
    pub objects: u64,
    pub moves: u64,
    pub unplaceable: u64,
}

pub struct RebalancePlanner {
    /// storage id -> datacenter
    nodes: BTreeMap<String, String>,
    evacuating: BTreeSet<String>,
    stats: RebalanceStats,
}

impl RebalancePlanner {
    pub fn new(
        nodes: impl IntoIterator<Item = StorageNode>,
        evacuating: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| (node.storage_id, node.datacenter))
                .collect(),
            evacuating: evacuating.into_iter().collect(),
            stats: RebalanceStats::default(),
        }
    }

    pub fn stats(&self) -> RebalanceStats {
        self.stats
    }

    fn is_healthy(&self, storage_id: &str) -> bool {
        self.nodes.contains_key(storage_id) && !self.evacuating.contains(storage_id)
    }

    /// Moves needed for one object; empty when all replicas are healthy.
    pub fn plan(&mut self, row: &RebalanceRow) -> Vec<RebalanceAction> {
        self.stats.objects += 1;
        let metadata = &row.metadata;
        if !metadata.is_object() {
            return Vec::new();
        }

        let mut holding: HashSet<&str> = metadata
            .sharks
            .iter()
            .map(|shark| shark.manta_storage_id.as_str())
            .collect();
        let mut used_datacenters: HashSet<&str> = metadata
            .sharks
            .iter()
            .filter(|shark| self.is_healthy(&shark.manta_storage_id))
            .filter_map(|shark| self.nodes.get(&shark.manta_storage_id))
            .map(String::as_str)
            .collect();

        let mut actions = Vec::new();
        for shark in &metadata.sharks {
            let from = shark.manta_storage_id.as_str();
            if self.is_healthy(from) {
                continue;
            }

            let choice = self
                .nodes
                .iter()
                .filter(|(id, _)| self.is_healthy(id) && !holding.contains(id.as_str()))
                .min_by_key(|(id, datacenter)| {
                    (
                        used_datacenters.contains(datacenter.as_str()),
                        placement_hash(&row.object_id, id),
                    )
                });
            let Some((to, datacenter)) = choice else {
                warn!(object_id = %row.object_id, %from, "no storage node available for replica");
                self.stats.unplaceable += 1;
                continue;
            };

            debug!(object_id = %row.object_id, %from, %to, "replica move planned");
            holding.insert(to.as_str());
            used_datacenters.insert(datacenter.as_str());
            self.stats.moves += 1;
            actions.push(RebalanceAction {
                object_id: row.object_id.clone(),
                owner: metadata.owner.clone().unwrap_or_default(),
                from: from.to_string(),
                to: to.clone(),
                shard: row.shard.clone(),
                key: metadata.key.clone(),
            });
        }
        actions
    }
}

fn placement_hash(object_id: &str, storage_id: &str) -> [u8; 16] {
    md5::compute(format!("{}:{}", object_id, storage_id)).0
}
