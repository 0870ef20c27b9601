/**
 * CONTAINER MANAGER - Intégration avec le substrat d'orchestration
 *
 * RÔLE : Certains store handlers déclarent un gestionnaire de conteneurs
 * associé (ex: kubernetes pour les clusters kube). Ce module définit le
 * trait commun et l'implémentation kubernetes (opérations sur les nodes).
 */

use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ContainerManagerError {
    #[error("container manager config invalid: {0}")]
    Config(String),
    #[error("container manager request failed: {0}")]
    Request(String),
    #[error("node '{0}' not found")]
    NodeNotFound(String),
}

/// Opérations de gestion de nodes exposées par un orchestrateur.
pub trait ContainerManager: Send {
    fn kind(&self) -> &str;
    fn node_registered(&self, address: &str) -> Result<bool, ContainerManagerError>;
    fn register_node(&self, address: &str) -> Result<(), ContainerManagerError>;
    fn remove_node(&self, address: &str) -> Result<(), ContainerManagerError>;
}

/// Gestionnaire kubernetes : manipule les nodes via l'API REST.
#[derive(Debug)]
pub struct KubeContainerManager {
    kind: String,
    server_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl KubeContainerManager {
    pub fn from_config(config: &Value) -> Result<Self, ContainerManagerError> {
        let server_url = config
            .get("server_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ContainerManagerError::Config("'server_url' is required".into()))?
            .trim_end_matches('/')
            .to_string();
        let kind = config
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("kubernetes")
            .to_string();
        let token = config
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ContainerManagerError::Config(e.to_string()))?;

        Ok(Self { kind, server_url, token, client })
    }

    fn node_url(&self, address: &str) -> String {
        format!("{}/api/v1/nodes/{}", self.server_url, address)
    }

    fn with_auth(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl ContainerManager for KubeContainerManager {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn node_registered(&self, address: &str) -> Result<bool, ContainerManagerError> {
        let resp = self
            .with_auth(self.client.get(self.node_url(address)))
            .send()
            .map_err(|e| ContainerManagerError::Request(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    fn register_node(&self, address: &str) -> Result<(), ContainerManagerError> {
        let body = json!({
            "kind": "Node",
            "apiVersion": "v1",
            "metadata": { "name": address },
            "spec": { "externalID": address },
        });
        let resp = self
            .with_auth(self.client.post(format!("{}/api/v1/nodes", self.server_url)))
            .json(&body)
            .send()
            .map_err(|e| ContainerManagerError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ContainerManagerError::Request(format!(
                "node registration for {} returned {}",
                address,
                resp.status()
            )));
        }
        Ok(())
    }

    fn remove_node(&self, address: &str) -> Result<(), ContainerManagerError> {
        let resp = self
            .with_auth(self.client.delete(self.node_url(address)))
            .send()
            .map_err(|e| ContainerManagerError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ContainerManagerError::NodeNotFound(address.to_string()));
        }
        if !resp.status().is_success() {
            return Err(ContainerManagerError::Request(format!(
                "node removal for {} returned {}",
                address,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_requires_server_url() {
        let err = KubeContainerManager::from_config(&json!({})).unwrap_err();
        assert!(matches!(err, ContainerManagerError::Config(_)));
    }

    #[test]
    fn from_config_defaults_to_kubernetes_kind() {
        let mgr = KubeContainerManager::from_config(&json!({
            "server_url": "http://127.0.0.1:8080/",
        }))
        .unwrap();
        assert_eq!(mgr.kind(), "kubernetes");
        assert_eq!(mgr.node_url("10.0.0.2"), "http://127.0.0.1:8080/api/v1/nodes/10.0.0.2");
    }
}
