/**
 * ETCD STORE HANDLER - Backend clé/valeur répliqué (API HTTP etcd v2)
 *
 * RÔLE : persistance de production. Parle à etcd via son API REST : une
 * entrée par champ scalaire, un répertoire par champ mapping. Les lectures
 * passent par le quorum par défaut pour refléter l'état répliqué.
 *
 * Le handler ne se connecte pas à l'instanciation : la première opération
 * échoue si le endpoint est injoignable, pas l'enregistrement.
 */

use serde_json::Value;
use std::time::Duration;

use crate::containermgr::{ContainerManager, KubeContainerManager};
use crate::models::Model;
use crate::store::{
    kv_delete_record, kv_get, kv_list_record_keys, kv_save, HandlerType, KvOps, StoreError,
    StoreHandler,
};

/// Validation de config : un endpoint HTTP est obligatoire.
pub fn check_config(config: &Value) -> Result<(), StoreError> {
    let endpoint = config
        .get("endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::HandlerConfig("'endpoint' is required".into()))?;
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(StoreError::HandlerConfig(format!(
            "'endpoint' must be an http(s) url, got '{endpoint}'"
        )));
    }
    if let Some(container) = config.get("container_manager") {
        if !container.is_object() {
            return Err(StoreError::HandlerConfig(
                "'container_manager' must be an object".into(),
            ));
        }
    }
    Ok(())
}

pub struct EtcdStoreHandler {
    endpoint: String,
    quorum: bool,
    client: reqwest::blocking::Client,
    container_config: Option<Value>,
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn leaf(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

impl EtcdStoreHandler {
    pub fn new(config: &Value) -> Result<Self, StoreError> {
        let endpoint = config
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::HandlerConfig("'endpoint' is required".into()))?
            .trim_end_matches('/')
            .to_string();
        let quorum = config
            .get("quorum")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let timeout = config
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(10);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| StoreError::HandlerConfig(e.to_string()))?;

        Ok(Self {
            endpoint,
            quorum,
            client,
            container_config: config.get("container_manager").cloned(),
        })
    }

    fn keys_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, key)
    }

    /// GET sur un noeud; 404 -> NotFound, le reste remonte en Backend.
    fn fetch_node(&self, key: &str) -> Result<Value, StoreError> {
        let mut request = self.client.get(self.keys_url(key));
        if self.quorum {
            request = request.query(&[("quorum", "true")]);
        }
        let response = request.send().map_err(backend)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(backend(format!(
                "etcd GET {} returned {}",
                key,
                response.status()
            )));
        }
        let body: Value = response.json().map_err(backend)?;
        body.get("node")
            .cloned()
            .ok_or_else(|| backend(format!("etcd GET {key} returned no node")))
    }

    fn child_nodes(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let node = self.fetch_node(key)?;
        Ok(node
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

impl KvOps for EtcdStoreHandler {
    fn kv_read(&mut self, key: &str) -> Result<String, StoreError> {
        let node = self.fetch_node(key)?;
        node.get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| backend(format!("etcd node {key} carries no value")))
    }

    fn kv_write(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.keys_url(key))
            .form(&[("value", value)])
            .send()
            .map_err(backend)?;
        if !response.status().is_success() {
            return Err(backend(format!(
                "etcd PUT {} returned {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }

    fn kv_delete(&mut self, key: &str, recursive: bool) -> Result<(), StoreError> {
        let mut request = self.client.delete(self.keys_url(key));
        if recursive {
            request = request.query(&[("recursive", "true")]);
        }
        let response = request.send().map_err(backend)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(backend(format!(
                "etcd DELETE {} returned {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }

    fn kv_children(&mut self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut children = Vec::new();
        for node in self.child_nodes(key)? {
            let is_dir = node.get("dir").and_then(Value::as_bool).unwrap_or(false);
            if is_dir {
                continue;
            }
            let Some(child_key) = node.get("key").and_then(Value::as_str) else {
                continue;
            };
            let value = node
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            children.push((leaf(child_key), value));
        }
        Ok(children)
    }

    fn kv_child_dirs(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut dirs = Vec::new();
        for node in self.child_nodes(key)? {
            let is_dir = node.get("dir").and_then(Value::as_bool).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(child_key) = node.get("key").and_then(Value::as_str) {
                dirs.push(leaf(child_key));
            }
        }
        Ok(dirs)
    }
}

impl StoreHandler for EtcdStoreHandler {
    fn handler_type(&self) -> HandlerType {
        HandlerType::Etcd
    }

    fn get(&mut self, model: &mut dyn Model, may_not_exist: bool) -> Result<bool, StoreError> {
        kv_get(self, model, may_not_exist)
    }

    fn save(&mut self, model: &dyn Model) -> Result<(), StoreError> {
        kv_save(self, model)
    }

    fn delete(&mut self, model: &dyn Model) -> Result<(), StoreError> {
        kv_delete_record(self, model)
    }

    fn list_record_keys(&mut self, collection_key: &str) -> Result<Vec<String>, StoreError> {
        kv_list_record_keys(self, collection_key)
    }

    fn container_manager(&self) -> Result<Option<Box<dyn ContainerManager>>, StoreError> {
        match &self.container_config {
            Some(config) => {
                let manager = KubeContainerManager::from_config(config)
                    .map_err(|e| StoreError::HandlerConfig(e.to_string()))?;
                Ok(Some(Box::new(manager)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_config_requires_http_endpoint() {
        assert!(matches!(
            check_config(&json!({})),
            Err(StoreError::HandlerConfig(_))
        ));
        assert!(matches!(
            check_config(&json!({ "endpoint": "2379" })),
            Err(StoreError::HandlerConfig(_))
        ));
        assert!(check_config(&json!({ "endpoint": "http://127.0.0.1:2379" })).is_ok());
    }

    #[test]
    fn keys_url_joins_endpoint_and_key() {
        let handler =
            EtcdStoreHandler::new(&json!({ "endpoint": "http://127.0.0.1:2379/" })).unwrap();
        assert_eq!(
            handler.keys_url("/armada/hosts/10.0.0.2/status"),
            "http://127.0.0.1:2379/v2/keys/armada/hosts/10.0.0.2/status"
        );
    }

    #[test]
    fn leaf_takes_last_segment() {
        assert_eq!(leaf("/armada/hosts/10.0.0.2"), "10.0.0.2");
        assert_eq!(leaf("plain"), "plain");
    }
}
