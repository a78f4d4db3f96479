use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use warden_model::{HeartbeatPayload, NodeId, NodeStatus, RunId, SandboxRun};

use crate::error::{Result, WardenError};

use super::{Registry, RegistryConfig};

/// In-memory registry for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    config: RegistryConfig,
    nodes: RwLock<HashMap<NodeId, NodeStatus>>,
    runs: RwLock<HashMap<RunId, SandboxRun>>,
}

impl InMemoryRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        let now = Utc::now();
        let mut nodes = self.nodes.write().await;
        nodes.retain(|_, node| node.is_live(now, self.config.node_ttl));

        let mut live: Vec<NodeStatus> = nodes.values().cloned().collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live)
    }

    async fn get_node(&self, id: &NodeId) -> Result<NodeStatus> {
        let nodes = self.nodes.read().await;
        nodes
            .get(id)
            .filter(|node| node.is_live(Utc::now(), self.config.node_ttl))
            .cloned()
            .ok_or_else(|| WardenError::NodeNotFound(id.clone()))
    }

    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let draining = nodes
            .get(&payload.node_id)
            .map(|existing| existing.draining)
            .unwrap_or(false);
        nodes.insert(payload.node_id.clone(), payload.into_status(draining));
        Ok(())
    }

    async fn mark_draining(&self, id: &NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .filter(|node| node.is_live(Utc::now(), self.config.node_ttl))
            .ok_or_else(|| WardenError::NodeNotFound(id.clone()))?;
        node.draining = true;
        Ok(())
    }

    async fn update_run(&self, run: &SandboxRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<SandboxRun> {
        let runs = self.runs.read().await;
        runs.get(id)
            .cloned()
            .ok_or(WardenError::RunNotFound(*id))
    }

    async fn list_runs(&self) -> Result<Vec<SandboxRun>> {
        let runs = self.runs.read().await;
        Ok(runs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use warden_model::Capacity;

    use super::*;

    fn heartbeat(id: &str, age_secs: i64) -> HeartbeatPayload {
        HeartbeatPayload {
            node_id: NodeId::from(id),
            address: format!("10.0.0.1:{id}"),
            labels: HashMap::new(),
            capacity: Capacity::new(4000, 8192),
            allocated: Capacity::default(),
            active_sandboxes: Vec::new(),
            sent_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn expired_nodes_vanish_from_list_and_get() {
        let registry = InMemoryRegistry::new(RegistryConfig {
            node_ttl: Duration::from_secs(30),
        });
        registry.heartbeat(heartbeat("fresh", 0)).await.unwrap();
        registry.heartbeat(heartbeat("stale", 60)).await.unwrap();

        let live = registry.list_nodes().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id.as_str(), "fresh");

        let err = registry.get_node(&NodeId::from("stale")).await.unwrap_err();
        assert!(matches!(err, WardenError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn heartbeat_overwrites_but_preserves_drain_flag() {
        let registry = InMemoryRegistry::new(RegistryConfig::default());
        registry.heartbeat(heartbeat("n1", 0)).await.unwrap();
        registry.mark_draining(&NodeId::from("n1")).await.unwrap();
        registry.heartbeat(heartbeat("n1", 0)).await.unwrap();

        let node = registry.get_node(&NodeId::from("n1")).await.unwrap();
        assert!(node.draining);
    }

    #[tokio::test]
    async fn mark_draining_unknown_node_errors() {
        let registry = InMemoryRegistry::new(RegistryConfig::default());
        let err = registry
            .mark_draining(&NodeId::from("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn list_nodes_is_sorted_by_id() {
        let registry = InMemoryRegistry::new(RegistryConfig::default());
        for id in ["charlie", "alpha", "bravo"] {
            registry.heartbeat(heartbeat(id, 0)).await.unwrap();
        }
        let ids: Vec<String> = registry
            .list_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id.to_string())
            .collect();
        assert_eq!(ids, vec!["alpha", "bravo", "charlie"]);
    }
}
