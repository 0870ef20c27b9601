use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::warn;

use crate::models::ModelKind;
use crate::store::{HandlerType, StoreError, StoreHandlerManager};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArmadaConfig {
    #[serde(default)]
    pub store: Vec<StoreConf>,
    #[serde(default)]
    pub ssh: SshConf,
    #[serde(default)]
    pub jobs: JobsConf,
}

/// Un enregistrement de store handler : backend + config + modèles servis.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConf {
    pub handler: HandlerType,
    #[serde(default)]
    pub config: serde_json::Value,
    pub models: Vec<ModelKind>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SshConf {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct JobsConf {
    /// Nombre de workers du pool de jobs; nombre de CPUs si absent.
    pub workers: Option<usize>,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    300
}

impl Default for SshConf {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for ArmadaConfig {
    fn default() -> Self {
        Self {
            // Par défaut tout part dans l'etcd local.
            store: vec![StoreConf {
                handler: HandlerType::Etcd,
                config: json!({ "endpoint": "http://127.0.0.1:2379" }),
                models: vec![
                    ModelKind::Host,
                    ModelKind::Cluster,
                    ModelKind::ClusterDeploy,
                    ModelKind::ClusterRestart,
                    ModelKind::ClusterUpgrade,
                ],
            }],
            ssh: SshConf::default(),
            jobs: JobsConf::default(),
        }
    }
}

/// Charge armada.yaml (ou le fichier pointé par ARMADA_CONFIG), config par
/// défaut si absent ou invalide.
pub fn load_config() -> ArmadaConfig {
    let path = std::env::var("ARMADA_CONFIG").unwrap_or_else(|_| "armada.yaml".into());
    if Path::new(&path).exists() {
        let txt = std::fs::read_to_string(&path).unwrap_or_default();
        if txt.trim().is_empty() {
            return ArmadaConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("config invalide dans {path}: {e}");
            ArmadaConfig::default()
        })
    } else {
        warn!("pas de {path}, usage config par défaut");
        ArmadaConfig::default()
    }
}

/// Construit le store manager depuis les enregistrements de config.
pub fn build_manager(config: &ArmadaConfig) -> Result<StoreHandlerManager, StoreError> {
    let mut manager = StoreHandlerManager::new();
    for entry in &config.store {
        manager.register_store_handler(entry.handler, entry.config.clone(), &entry.models)?;
    }
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_config_parses_store_entries() {
        let yaml = r#"
store:
  - handler: memory
    config:
      namespace: dev
    models: [host, cluster]
ssh:
  connect_timeout_secs: 3
"#;
        let config: ArmadaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.len(), 1);
        assert_eq!(config.store[0].handler, HandlerType::Memory);
        assert_eq!(
            config.store[0].models,
            vec![ModelKind::Host, ModelKind::Cluster]
        );
        assert_eq!(config.ssh.connect_timeout_secs, 3);
        // Défaut appliqué aux champs absents.
        assert_eq!(config.ssh.command_timeout_secs, 300);

        let manager = build_manager(&config).unwrap();
        assert_eq!(manager.live_handler_count(), 0);
    }

    #[test]
    fn default_config_registers_every_model_kind() {
        let config = ArmadaConfig::default();
        assert_eq!(config.store[0].models.len(), 5);
        build_manager(&config).unwrap();
    }
}
