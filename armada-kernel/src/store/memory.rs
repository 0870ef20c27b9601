/**
 * MEMORY STORE HANDLER - Backend clé/valeur en mémoire
 *
 * RÔLE : backend de développement et de test. Les arbres sont partagés par
 * namespace à l'échelle du processus : un manager reconstruit depuis un
 * snapshot retombe sur les mêmes données tant qu'on reste dans le même
 * processus.
 */

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::containermgr::{ContainerManager, KubeContainerManager};
use crate::store::{
    kv_delete_record, kv_get, kv_list_record_keys, kv_save, HandlerType, KvOps, StoreError,
    StoreHandler,
};
use crate::models::Model;

// namespace -> (clé complète -> valeur)
static STORES: Mutex<BTreeMap<String, BTreeMap<String, String>>> = Mutex::new(BTreeMap::new());

/// Validation de config : namespace et container_manager sont optionnels
/// mais doivent être bien typés.
pub fn check_config(config: &Value) -> Result<(), StoreError> {
    if let Some(namespace) = config.get("namespace") {
        if !namespace.is_string() {
            return Err(StoreError::HandlerConfig(
                "'namespace' must be a string".into(),
            ));
        }
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

pub struct MemoryStoreHandler {
    namespace: String,
    container_config: Option<Value>,
}

impl MemoryStoreHandler {
    pub fn new(config: &Value) -> Result<Self, StoreError> {
        let namespace = config
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        Ok(Self {
            namespace,
            container_config: config.get("container_manager").cloned(),
        })
    }

    fn with_tree<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> T {
        let mut stores = STORES.lock();
        let tree = stores.entry(self.namespace.clone()).or_default();
        f(tree)
    }
}

/// Chemin relatif de `key` sous le répertoire `dir`, en respectant la
/// frontière de segment. None si `key` ne vit pas sous `dir`.
fn remainder<'a>(dir: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(dir)?.strip_prefix('/')
}

impl KvOps for MemoryStoreHandler {
    fn kv_read(&mut self, key: &str) -> Result<String, StoreError> {
        self.with_tree(|tree| {
            tree.get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        })
    }

    fn kv_write(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_tree(|tree| {
            tree.insert(key.to_string(), value.to_string());
        });
        Ok(())
    }

    fn kv_delete(&mut self, key: &str, recursive: bool) -> Result<(), StoreError> {
        self.with_tree(|tree| {
            let mut removed = tree.remove(key).is_some();
            if recursive {
                let doomed: Vec<String> = tree
                    .keys()
                    .filter(|k| remainder(key, k).is_some())
                    .cloned()
                    .collect();
                for k in doomed {
                    tree.remove(&k);
                    removed = true;
                }
            }
            if removed {
                Ok(())
            } else {
                Err(StoreError::NotFound(key.to_string()))
            }
        })
    }

    fn kv_children(&mut self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.with_tree(|tree| {
            let mut children = Vec::new();
            let mut dir_exists = false;
            for (k, v) in tree.iter() {
                if let Some(rest) = remainder(key, k) {
                    dir_exists = true;
                    if !rest.contains('/') {
                        children.push((rest.to_string(), v.clone()));
                    }
                }
            }
            if dir_exists {
                Ok(children)
            } else {
                Err(StoreError::NotFound(key.to_string()))
            }
        })
    }

    fn kv_child_dirs(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_tree(|tree| {
            let mut dirs: Vec<String> = Vec::new();
            let mut dir_exists = false;
            for k in tree.keys() {
                if let Some(rest) = remainder(key, k) {
                    dir_exists = true;
                    if let Some((first, _)) = rest.split_once('/') {
                        if !dirs.iter().any(|d| d == first) {
                            dirs.push(first.to_string());
                        }
                    }
                }
            }
            if dir_exists {
                Ok(dirs)
            } else {
                Err(StoreError::NotFound(key.to_string()))
            }
        })
    }
}

impl StoreHandler for MemoryStoreHandler {
    fn handler_type(&self) -> HandlerType {
        HandlerType::Memory
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
