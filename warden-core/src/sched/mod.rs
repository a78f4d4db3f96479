//! Placement engine. Given a request and the live node set, selects a
//! node under a configurable strategy, honoring hard constraints,
//! quarantine routing, and soft affinity. Pure CPU, no side effects:
//! given identical inputs the same node ID comes back.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use warden_model::{NodeId, NodeStatus, SandboxRequest};

use crate::error::{Result, WardenError};

/// Strategy selection recognized by the scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    LeastLoaded,
    BinPacking,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: Strategy,
}

/// Scores one candidate node; higher is better. Ties break stably on
/// node ID.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, request: &SandboxRequest, node: &NodeStatus) -> i64;
}

/// Maximises free memory: spread work across the emptiest nodes.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl PlacementStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn score(&self, _request: &SandboxRequest, node: &NodeStatus) -> i64 {
        node.free().memory_mb as i64
    }
}

/// Minimises free memory after placement: tightest fit first.
#[derive(Debug, Default)]
pub struct BinPacking;

impl PlacementStrategy for BinPacking {
    fn name(&self) -> &'static str {
        "bin-packing"
    }

    fn score(&self, request: &SandboxRequest, node: &NodeStatus) -> i64 {
        let after = node
            .free()
            .memory_mb
            .saturating_sub(request.resources.memory_mb);
        -(after as i64)
    }
}

pub struct Scheduler {
    strategy: Arc<dyn PlacementStrategy>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let strategy: Arc<dyn PlacementStrategy> = match config.strategy {
            Strategy::LeastLoaded => Arc::new(LeastLoaded),
            Strategy::BinPacking => Arc::new(BinPacking),
        };
        Self { strategy }
    }

    pub fn with_strategy(strategy: Arc<dyn PlacementStrategy>) -> Self {
        Self { strategy }
    }

    /// Select a node for `request` out of `nodes` (already filtered for
    /// liveness by the registry). Does not mutate anything; the caller
    /// records the allocation through the registry.
    pub fn schedule(&self, request: &SandboxRequest, nodes: &[NodeStatus]) -> Result<NodeId> {
        let mut candidates: Vec<&NodeStatus> = nodes
            .iter()
            .filter(|node| !node.draining)
            .filter(|node| node.free().holds(&request.resources))
            .filter(|node| labels_match(&node.labels, &request.required_labels()))
            .collect();

        // Quarantined work only lands on quarantine nodes, and nothing
        // else ever does.
        let quarantined = request.is_quarantined();
        candidates.retain(|node| node.is_quarantine_node() == quarantined);

        if candidates.is_empty() {
            return Err(WardenError::NoCapacity {
                detail: format!(
                    "no eligible node for request {} (cpu={}m mem={}MB gpu={} quarantine={})",
                    request.id,
                    request.resources.cpu_millis,
                    request.resources.memory_mb,
                    request.resources.gpu,
                    quarantined,
                ),
            });
        }

        // Soft affinity: prefer matching nodes, but fall back to the full
        // candidate set rather than failing.
        let affinity = request.affinity_labels();
        if !affinity.is_empty() {
            let matching: Vec<&NodeStatus> = candidates
                .iter()
                .copied()
                .filter(|node| labels_match(&node.labels, &affinity))
                .collect();
            if !matching.is_empty() {
                candidates = matching;
            }
        }

        // Soft anti-affinity: drop matching nodes unless that would leave
        // nothing.
        let anti = request.anti_affinity_labels();
        if !anti.is_empty() {
            let remaining: Vec<&NodeStatus> = candidates
                .iter()
                .copied()
                .filter(|node| !labels_overlap(&node.labels, &anti))
                .collect();
            if !remaining.is_empty() {
                candidates = remaining;
            }
        }

        // Stable order before scoring so ties break on node ID no matter
        // how the input was arranged.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = candidates
            .into_iter()
            .max_by(|a, b| {
                self.strategy
                    .score(request, a)
                    .cmp(&self.strategy.score(request, b))
                    // max_by keeps the last maximum; reverse the ID order so
                    // the smallest ID wins ties.
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|node| node.id.clone())
            .ok_or_else(|| WardenError::NoCapacity {
                detail: "candidate set empty after scoring".to_string(),
            })?;

        debug!(
            request = %request.id,
            node = %chosen,
            strategy = self.strategy.name(),
            "placement decided"
        );
        Ok(chosen)
    }
}

/// `selector` ⊆ `labels`, comparing values.
fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<&str, &str>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(*k).is_some_and(|actual| actual == v))
}

/// Any selector entry present with an equal value.
fn labels_overlap(labels: &HashMap<String, String>, selector: &HashMap<&str, &str>) -> bool {
    selector
        .iter()
        .any(|(k, v)| labels.get(*k).is_some_and(|actual| actual == v))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use warden_model::{Capacity, ResourceSpec, TemplateId};

    use super::*;

    fn node(id: &str, free_mem: u64) -> NodeStatus {
        NodeStatus {
            id: NodeId::from(id),
            address: format!("{id}.internal:7001"),
            labels: HashMap::new(),
            capacity: Capacity::new(8000, 8192),
            allocated: Capacity::new(0, 8192 - free_mem),
            active_sandboxes: Vec::new(),
            last_heartbeat: Utc::now(),
            draining: false,
        }
    }

    fn quarantine_node(id: &str, free_mem: u64) -> NodeStatus {
        let mut n = node(id, free_mem);
        n.labels
            .insert("quarantine".to_string(), "true".to_string());
        n
    }

    fn request(cpu: u64, mem: u64) -> SandboxRequest {
        SandboxRequest::new(
            TemplateId::from("t"),
            ResourceSpec::new(cpu, mem, Duration::from_secs(30)),
        )
    }

    #[test]
    fn least_loaded_picks_the_emptiest_node() {
        let scheduler = Scheduler::new(SchedulerConfig {
            strategy: Strategy::LeastLoaded,
        });
        let nodes = vec![node("a", 1024), node("b", 4096), node("c", 2048)];
        let chosen = scheduler.schedule(&request(500, 64), &nodes).unwrap();
        assert_eq!(chosen.as_str(), "b");
    }

    #[test]
    fn bin_packing_picks_the_tightest_fit() {
        let scheduler = Scheduler::new(SchedulerConfig {
            strategy: Strategy::BinPacking,
        });
        let nodes = vec![node("a", 1024), node("b", 4096), node("c", 128)];
        let chosen = scheduler.schedule(&request(500, 64), &nodes).unwrap();
        assert_eq!(chosen.as_str(), "c");
    }

    #[test]
    fn deterministic_under_input_permutation() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let req = request(500, 64);
        let forward = vec![node("a", 2048), node("b", 2048), node("c", 2048)];
        let backward = vec![node("c", 2048), node("b", 2048), node("a", 2048)];
        assert_eq!(
            scheduler.schedule(&req, &forward).unwrap(),
            scheduler.schedule(&req, &backward).unwrap()
        );
        // All scores equal: the smallest ID wins.
        assert_eq!(scheduler.schedule(&req, &forward).unwrap().as_str(), "a");
    }

    #[test]
    fn oversized_request_yields_no_capacity() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let nodes = vec![node("a", 1024)];
        let err = scheduler.schedule(&request(500, 100_000), &nodes).unwrap_err();
        assert!(matches!(err, WardenError::NoCapacity { .. }));
    }

    #[test]
    fn draining_nodes_are_skipped() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut draining = node("a", 4096);
        draining.draining = true;
        let nodes = vec![draining, node("b", 1024)];
        let chosen = scheduler.schedule(&request(500, 64), &nodes).unwrap();
        assert_eq!(chosen.as_str(), "b");
    }

    #[test]
    fn quarantined_requests_only_land_on_quarantine_nodes() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let nodes = vec![
            node("plain-1", 4096),
            node("plain-2", 4096),
            quarantine_node("q-1", 1024),
            quarantine_node("q-2", 1024),
        ];

        let mut marked = request(500, 64);
        marked.mark_quarantined();
        let chosen = scheduler.schedule(&marked, &nodes).unwrap();
        assert!(chosen.as_str().starts_with("q-"));

        let unmarked = request(500, 64);
        let chosen = scheduler.schedule(&unmarked, &nodes).unwrap();
        assert!(chosen.as_str().starts_with("plain-"));
    }

    #[test]
    fn affinity_prefers_matching_nodes_and_falls_back() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut zoned = node("zoned", 512);
        zoned
            .labels
            .insert("zone".to_string(), "eu-west".to_string());
        let nodes = vec![node("big", 4096), zoned];

        let mut req = request(500, 64);
        req.metadata.insert(
            "scheduler.affinity.zone".to_string(),
            "eu-west".to_string(),
        );
        // The zoned node wins despite being smaller.
        assert_eq!(scheduler.schedule(&req, &nodes).unwrap().as_str(), "zoned");

        // No node matches: fall back to the full filtered set.
        let mut req = request(500, 64);
        req.metadata
            .insert("scheduler.affinity.zone".to_string(), "ap-south".to_string());
        assert_eq!(scheduler.schedule(&req, &nodes).unwrap().as_str(), "big");
    }

    #[test]
    fn anti_affinity_drops_unless_it_would_empty_the_set() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut noisy = node("noisy", 4096);
        noisy
            .labels
            .insert("tenant".to_string(), "loud".to_string());
        let nodes = vec![noisy.clone(), node("quiet", 512)];

        let mut req = request(500, 64);
        req.metadata.insert(
            "scheduler.antiaffinity.tenant".to_string(),
            "loud".to_string(),
        );
        assert_eq!(scheduler.schedule(&req, &nodes).unwrap().as_str(), "quiet");

        // Only the matching node remains: keep it rather than fail.
        let only_noisy = vec![noisy];
        assert_eq!(
            scheduler.schedule(&req, &only_noisy).unwrap().as_str(),
            "noisy"
        );
    }

    #[test]
    fn required_labels_are_hard() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut gpu_node = node("gpu", 512);
        gpu_node
            .labels
            .insert("accelerator".to_string(), "a100".to_string());
        let nodes = vec![node("plain", 4096), gpu_node];

        let mut req = request(500, 64);
        req.metadata.insert(
            "scheduler.require.accelerator".to_string(),
            "a100".to_string(),
        );
        assert_eq!(scheduler.schedule(&req, &nodes).unwrap().as_str(), "gpu");

        req.metadata.insert(
            "scheduler.require.accelerator".to_string(),
            "h100".to_string(),
        );
        assert!(matches!(
            scheduler.schedule(&req, &nodes).unwrap_err(),
            WardenError::NoCapacity { .. }
        ));
    }
}
