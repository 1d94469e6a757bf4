//! Bounded breadth-first discovery of the family component around a seed.
//!
//! Edges are walked in both directions for reachability. Each hop issues one
//! batched fetch for the whole frontier, so a discovery costs at most
//! `max_hops` store round-trips regardless of how many profiles it touches.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use crate::config::DiscoveryConfig;
use crate::db::Db;
use crate::error::Result;
use crate::identity::require_profile;
use crate::store::{edges_touching, RelationshipEdge};

/// Hop ceiling and visited-profile safety cap for one discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryLimits {
    pub max_hops: usize,
    pub max_nodes: usize,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        DiscoveryConfig::default().into()
    }
}

impl From<DiscoveryConfig> for DiscoveryLimits {
    fn from(config: DiscoveryConfig) -> Self {
        Self {
            max_hops: config.max_hops,
            max_nodes: config.max_nodes.max(1),
        }
    }
}

/// Profiles and edges reachable from a seed within the limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    pub seed: String,
    /// Every profile touched, seed included.
    pub nodes: BTreeSet<String>,
    /// Deduplicated by edge id, in discovery order.
    pub edges: Vec<RelationshipEdge>,
    /// Rounds that fetched edges.
    pub hops: usize,
    /// The node cap stopped expansion before the frontier emptied.
    pub truncated: bool,
}

impl Component {
    /// Profiles sharing an edge with the seed.
    pub fn direct_neighbors(&self) -> HashSet<&str> {
        self.edges
            .iter()
            .filter_map(|e| e.other_end(&self.seed))
            .collect()
    }
}

/// Visited set and collected edges carried from one round to the next.
#[derive(Debug)]
struct Traversal {
    visited: HashSet<String>,
    seen_edges: HashSet<String>,
    edges: Vec<RelationshipEdge>,
    max_nodes: usize,
    truncated: bool,
}

impl Traversal {
    fn new(seed: &str, max_nodes: usize) -> Self {
        Self {
            visited: HashSet::from([seed.to_string()]),
            seen_edges: HashSet::new(),
            edges: Vec::new(),
            max_nodes,
            truncated: false,
        }
    }

    /// Admit a profile, respecting the node cap. True if it is (now) visited.
    fn admit(&mut self, profile_id: &str, next: &mut Vec<String>) -> bool {
        if self.visited.contains(profile_id) {
            return true;
        }
        if self.visited.len() >= self.max_nodes {
            self.truncated = true;
            return false;
        }
        self.visited.insert(profile_id.to_string());
        next.push(profile_id.to_string());
        true
    }

    /// Fold one round's edges in and return the next frontier.
    fn absorb(&mut self, fetched: Vec<RelationshipEdge>) -> Vec<String> {
        let mut next = Vec::new();
        for edge in fetched {
            if self.seen_edges.contains(&edge.edge_id) {
                continue;
            }
            let subject_in = self.admit(&edge.subject_id, &mut next);
            let object_in = self.admit(&edge.object_id, &mut next);
            if subject_in && object_in {
                self.seen_edges.insert(edge.edge_id.clone());
                self.edges.push(edge);
            }
        }
        next
    }
}

/// Discover the component reachable from `seed_id` within `limits`.
///
/// A failed fetch fails the whole discovery; no partial graph is returned.
pub async fn discover(db: &Db, seed_id: &str, limits: DiscoveryLimits) -> Result<Component> {
    let seed = seed_id.to_string();
    {
        let seed = seed.clone();
        db.with_connection(move |conn| require_profile(conn, &seed).map(|_| ())).await?;
    }

    let mut traversal = Traversal::new(&seed, limits.max_nodes.max(1));
    let mut frontier = vec![seed.clone()];
    let mut hops = 0;

    while hops < limits.max_hops && !frontier.is_empty() {
        let batch = std::mem::take(&mut frontier);
        let batch_len = batch.len();
        let fetched = db.with_connection(move |conn| edges_touching(conn, &batch)).await?;
        hops += 1;
        log::debug!(
            "Discovery from {} hop {}: frontier={} fetched={} edges",
            seed, hops, batch_len, fetched.len()
        );
        frontier = traversal.absorb(fetched);
    }

    if traversal.truncated {
        log::warn!(
            "Discovery from {} stopped at the {} profile cap",
            seed, limits.max_nodes
        );
    }

    Ok(Component {
        nodes: traversal.visited.into_iter().collect(),
        edges: traversal.edges,
        seed,
        hops,
        truncated: traversal.truncated,
    })
}
