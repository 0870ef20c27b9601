/**
 * STORE HANDLER MANAGER - Persistance type-routée des modèles
 *
 * RÔLE :
 * Découple la persistance des modèles de tout backend concret et permet à
 * plusieurs backends de coexister (ex: etcd pour les hosts, mémoire pour le
 * développement).
 *
 * FONCTIONNEMENT :
 * - register_store_handler = une entrée de registre par (handler, config,
 *   types de modèles servis); un type de modèle -> exactement un handler
 * - get/save/delete/list = dispatch vers le handler du type, instanciation
 *   paresseuse avec vérification de config au premier usage
 * - clone() = même registre, zéro handler vivant (les connexions ne
 *   traversent pas une frontière de processus)
 * - snapshot()/from_snapshot() = image sérialisable du registre pour les
 *   workers lancés en processus séparés
 *
 * UTILITÉ DANS ARMADA :
 * ✅ Les workers reçoivent un clone et se reconnectent paresseusement
 * ✅ Un handler mal configuré échoue à l'usage, pas à l'enregistrement
 * ✅ Introspection : handlers uniques + container managers associés
 */

pub mod etcd;
pub mod memory;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::containermgr::ContainerManager;
use crate::models::{Model, ModelDef, ModelError, ModelKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no record found at '{0}'")]
    NotFound(String),
    #[error("model kind '{0}' is already registered")]
    DuplicateRegistration(ModelKind),
    #[error("no store handler registered for model kind '{0}'")]
    NoHandler(ModelKind),
    #[error("store handler configuration rejected: {0}")]
    HandlerConfig(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Backends disponibles. Le tag est sérialisable : il voyage dans les
/// snapshots de registre vers les processus workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    Etcd,
    Memory,
}

impl HandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::Etcd => "etcd",
            HandlerType::Memory => "memory",
        }
    }

    /// Validation de config, déclenchée au premier usage du handler.
    pub fn check_config(&self, config: &Value) -> Result<(), StoreError> {
        match self {
            HandlerType::Etcd => etcd::check_config(config),
            HandlerType::Memory => memory::check_config(config),
        }
    }

    fn instantiate(&self, config: &Value) -> Result<Box<dyn StoreHandler>, StoreError> {
        self.check_config(config)?;
        match self {
            HandlerType::Etcd => Ok(Box::new(etcd::EtcdStoreHandler::new(config)?)),
            HandlerType::Memory => Ok(Box::new(memory::MemoryStoreHandler::new(config)?)),
        }
    }
}

/// Implémentation backend des quatre opérations pour un ou plusieurs types
/// de modèles.
pub trait StoreHandler: Send {
    fn handler_type(&self) -> HandlerType;

    /// Remplit l'instance depuis le store. Retourne true si le record
    /// existe. En mode strict (may_not_exist = false), l'absence totale de
    /// record est une erreur NotFound.
    fn get(&mut self, model: &mut dyn Model, may_not_exist: bool) -> Result<bool, StoreError>;

    fn save(&mut self, model: &dyn Model) -> Result<(), StoreError>;

    fn delete(&mut self, model: &dyn Model) -> Result<(), StoreError>;

    /// Clés primaires des records présents sous une collection.
    fn list_record_keys(&mut self, collection_key: &str) -> Result<Vec<String>, StoreError>;

    /// Gestionnaire de conteneurs associé, si le handler en déclare un.
    fn container_manager(&self) -> Result<Option<Box<dyn ContainerManager>>, StoreError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Algorithme générique get/save/delete au-dessus d'un store clé/valeur.
// Les deux backends l'empruntent via le trait KvOps.

/// Opérations clé/valeur brutes qu'un backend doit fournir.
pub(crate) trait KvOps {
    fn kv_read(&mut self, key: &str) -> Result<String, StoreError>;
    fn kv_write(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn kv_delete(&mut self, key: &str, recursive: bool) -> Result<(), StoreError>;
    /// Paires (sous-clé, valeur) directement sous un répertoire.
    fn kv_children(&mut self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
    /// Noms des sous-répertoires directement sous un répertoire.
    fn kv_child_dirs(&mut self, key: &str) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn kv_get(
    ops: &mut dyn KvOps,
    model: &mut dyn Model,
    may_not_exist: bool,
) -> Result<bool, StoreError> {
    let prefix = model.store_key();
    let mut found_any = false;

    for field in model.fields_mut() {
        if field.is_directory() {
            let dir_key = format!("{}/{}", prefix, field.name());
            match ops.kv_children(&dir_key) {
                Ok(children) => {
                    field.clear();
                    for (leaf, raw) in children {
                        field
                            .absorb(Some(&leaf), &raw)
                            .map_err(ModelError::Field)?;
                        found_any = true;
                    }
                }
                Err(StoreError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }
        } else {
            let key = format!("{}/{}", prefix, field.name());
            match ops.kv_read(&key) {
                Ok(raw) => {
                    field.absorb(None, &raw).map_err(ModelError::Field)?;
                    found_any = true;
                }
                // Un champ optionnel absent laisse le field non affecté;
                // seule l'absence totale du record compte.
                Err(StoreError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }
        }
    }

    if !found_any && !may_not_exist {
        return Err(StoreError::NotFound(prefix));
    }
    Ok(found_any)
}

pub(crate) fn kv_save(ops: &mut dyn KvOps, model: &dyn Model) -> Result<(), StoreError> {
    let prefix = model.store_key();

    // Sauver remplace le record : les mappings sont purgés avant réécriture
    // (sinon les sous-clés retirées survivraient), et un champ scalaire non
    // affecté efface la clé qu'un record précédent aurait pu laisser.
    for field in model.fields() {
        if field.is_directory() {
            let dir_key = format!("{}/{}", prefix, field.name());
            match ops.kv_delete(&dir_key, true) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }
        } else if !field.is_set() {
            let key = format!("{}/{}", prefix, field.name());
            match ops.kv_delete(&key, false) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }
        }
    }

    for item in model.render() {
        if let Some(value) = item.value {
            ops.kv_write(&item.key, &value)?;
        }
    }
    Ok(())
}

pub(crate) fn kv_delete_record(ops: &mut dyn KvOps, model: &dyn Model) -> Result<(), StoreError> {
    ops.kv_delete(&model.store_key(), true)
}

pub(crate) fn kv_list_record_keys(
    ops: &mut dyn KvOps,
    collection_key: &str,
) -> Result<Vec<String>, StoreError> {
    match ops.kv_child_dirs(collection_key) {
        Ok(dirs) => Ok(dirs),
        Err(StoreError::NotFound(_)) => Ok(Vec::new()),
        Err(other) => Err(other),
    }
}

// ---------------------------------------------------------------------------
// Registre + manager

/// Une entrée de registre : un handler, sa config, les types servis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub handler_type: HandlerType,
    pub config: Value,
    pub kinds: Vec<ModelKind>,
}

/// Image sérialisable du registre, transmise aux processus workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub registrations: Vec<Registration>,
}

pub struct StoreHandlerManager {
    registrations: Vec<Registration>,
    registry: BTreeMap<ModelKind, usize>,
    handlers: HashMap<usize, Box<dyn StoreHandler>>,
}

impl Default for StoreHandlerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Le clone emporte le registre mais aucun handler vivant : les instances
/// (connexions réseau comprises) ne sont pas sûres à partager entre
/// processus.
impl Clone for StoreHandlerManager {
    fn clone(&self) -> Self {
        Self {
            registrations: self.registrations.clone(),
            registry: self.registry.clone(),
            handlers: HashMap::new(),
        }
    }
}

impl StoreHandlerManager {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            registry: BTreeMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Enregistre un handler pour un ou plusieurs types de modèles.
    /// Chaque type listé doit être encore libre.
    pub fn register_store_handler(
        &mut self,
        handler_type: HandlerType,
        config: Value,
        kinds: &[ModelKind],
    ) -> Result<(), StoreError> {
        for kind in kinds {
            if self.registry.contains_key(kind) {
                return Err(StoreError::DuplicateRegistration(*kind));
            }
        }
        let idx = self.registrations.len();
        self.registrations.push(Registration {
            handler_type,
            config,
            kinds: kinds.to_vec(),
        });
        for kind in kinds {
            self.registry.insert(*kind, idx);
        }
        debug!(handler = handler_type.as_str(), ?kinds, "store handler registered");
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            registrations: self.registrations.clone(),
        }
    }

    /// Reconstruit un manager côté worker, handlers vides; ils se
    /// reconnecteront au premier usage.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let mut registry = BTreeMap::new();
        for (idx, registration) in snapshot.registrations.iter().enumerate() {
            for kind in &registration.kinds {
                registry.entry(*kind).or_insert(idx);
            }
        }
        Self {
            registrations: snapshot.registrations,
            registry,
            handlers: HashMap::new(),
        }
    }

    /// Nombre de handlers réellement instanciés (introspection/tests).
    pub fn live_handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn ensure_handler_idx(&mut self, idx: usize) -> Result<&mut Box<dyn StoreHandler>, StoreError> {
        let Self { registrations, handlers, .. } = self;
        match handlers.entry(idx) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                let registration = &registrations[idx];
                let handler = registration
                    .handler_type
                    .instantiate(&registration.config)?;
                Ok(vacant.insert(handler))
            }
        }
    }

    fn handler_for(&mut self, kind: ModelKind) -> Result<&mut Box<dyn StoreHandler>, StoreError> {
        let idx = *self
            .registry
            .get(&kind)
            .ok_or(StoreError::NoHandler(kind))?;
        self.ensure_handler_idx(idx)
    }

    /// Lecture stricte : NotFound si le record n'existe pas.
    pub fn get<M: Model + ModelDef>(&mut self, mut instance: M) -> Result<M, StoreError> {
        let handler = self.handler_for(M::model_kind())?;
        handler.get(&mut instance, false)?;
        Ok(instance)
    }

    /// Lecture tolérante : les champs absents restent non affectés,
    /// l'existence du record est remontée en booléen.
    pub fn get_optional<M: Model + ModelDef>(
        &mut self,
        mut instance: M,
    ) -> Result<(M, bool), StoreError> {
        let handler = self.handler_for(M::model_kind())?;
        let exists = handler.get(&mut instance, true)?;
        Ok((instance, exists))
    }

    pub fn save<M: Model + ModelDef>(&mut self, instance: M) -> Result<M, StoreError> {
        let handler = self.handler_for(M::model_kind())?;
        handler.save(&instance)?;
        Ok(instance)
    }

    pub fn delete<M: Model + ModelDef>(&mut self, instance: &M) -> Result<(), StoreError> {
        let handler = self.handler_for(M::model_kind())?;
        handler.delete(instance)
    }

    /// Retourne des instances complètes, pas un curseur.
    pub fn list<M: Model + ModelDef>(&mut self) -> Result<Vec<M>, StoreError> {
        let leaves = {
            let handler = self.handler_for(M::model_kind())?;
            handler.list_record_keys(M::collection())?
        };
        let mut records = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let mut instance = M::with_primary_key(&leaf);
            let handler = self.handler_for(M::model_kind())?;
            handler.get(&mut instance, false)?;
            records.push(instance);
        }
        Ok(records)
    }

    /// Une instance par type de handler réellement instancié, pas une par
    /// type de modèle.
    pub fn list_store_handlers(&mut self) -> Result<Vec<&dyn StoreHandler>, StoreError> {
        for idx in 0..self.registrations.len() {
            self.ensure_handler_idx(idx)?;
        }
        let mut seen: Vec<HandlerType> = Vec::new();
        let mut unique = Vec::new();
        for (idx, registration) in self.registrations.iter().enumerate() {
            if seen.contains(&registration.handler_type) {
                continue;
            }
            seen.push(registration.handler_type);
            if let Some(handler) = self.handlers.get(&idx) {
                unique.push(handler.as_ref());
            }
        }
        Ok(unique)
    }

    /// Instancie les container managers déclarés par les handlers,
    /// dédupliqués par kind (le premier enregistré gagne). Un kind demandé
    /// mais absent du registre donne une liste vide. Tous les
    /// enregistrements ne font donc pas forcément surface ici.
    pub fn list_container_managers(
        &mut self,
        kind_filter: Option<&str>,
    ) -> Result<Vec<Box<dyn ContainerManager>>, StoreError> {
        let mut managers: Vec<Box<dyn ContainerManager>> = Vec::new();
        for idx in 0..self.registrations.len() {
            let handler = self.ensure_handler_idx(idx)?;
            if let Some(manager) = handler.container_manager()? {
                if managers.iter().any(|m| m.kind() == manager.kind()) {
                    continue;
                }
                managers.push(manager);
            }
        }
        if let Some(kind) = kind_filter {
            managers.retain(|m| m.kind() == kind);
        }
        Ok(managers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cluster, Host, HostStatus};
    use serde_json::json;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn memory_config() -> (Value, String) {
        let namespace = Uuid::new_v4().to_string();
        (json!({ "namespace": namespace }), namespace)
    }

    fn manager_with_memory(kinds: &[ModelKind]) -> (StoreHandlerManager, Value) {
        let (config, _) = memory_config();
        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(HandlerType::Memory, config.clone(), kinds)
            .unwrap();
        (manager, config)
    }

    #[test]
    fn register_rejects_duplicate_model_kind() {
        let (mut manager, _) = manager_with_memory(&[ModelKind::Host]);
        let (other_config, _) = memory_config();
        let err = manager
            .register_store_handler(HandlerType::Memory, other_config, &[ModelKind::Host])
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DuplicateRegistration(ModelKind::Host)
        ));
    }

    #[test]
    fn operations_dispatch_to_the_registered_handler() {
        // Deux backends mémoire isolés : les hosts vont dans l'un,
        // les clusters dans l'autre.
        let (host_config, _) = memory_config();
        let (cluster_config, _) = memory_config();
        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(HandlerType::Memory, host_config.clone(), &[ModelKind::Host])
            .unwrap();
        manager
            .register_store_handler(
                HandlerType::Memory,
                cluster_config.clone(),
                &[ModelKind::Cluster],
            )
            .unwrap();

        let mut host = Host::new("10.0.0.2");
        host.set_status(HostStatus::Active);
        manager.save(host).unwrap();

        // Relire via un manager ne connaissant que le backend des hosts.
        let mut host_only = StoreHandlerManager::new();
        host_only
            .register_store_handler(HandlerType::Memory, host_config, &[ModelKind::Host])
            .unwrap();
        let read = host_only.get(Host::new("10.0.0.2")).unwrap();
        assert_eq!(read.status(), Some(HostStatus::Active));

        // Le backend des clusters, lui, n'a jamais vu ce host.
        let mut cluster_side = StoreHandlerManager::new();
        cluster_side
            .register_store_handler(HandlerType::Memory, cluster_config, &[ModelKind::Host])
            .unwrap();
        assert!(matches!(
            cluster_side.get(Host::new("10.0.0.2")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn clone_keeps_registry_and_drops_live_handlers() {
        let (mut manager, _) = manager_with_memory(&[ModelKind::Host, ModelKind::Cluster]);
        // Forcer l'instanciation d'un handler.
        let _ = manager.get_optional(Host::new("10.0.0.9")).unwrap();
        assert_eq!(manager.live_handler_count(), 1);

        let clone = manager.clone();
        assert_eq!(clone.snapshot(), manager.snapshot());
        assert_eq!(clone.live_handler_count(), 0);
    }

    #[test]
    fn snapshot_round_trips_through_serde() {
        let (manager, _) = manager_with_memory(&[ModelKind::Host]);
        let encoded = serde_json::to_string(&manager.snapshot()).unwrap();
        let decoded: RegistrySnapshot = serde_json::from_str(&encoded).unwrap();
        let rebuilt = StoreHandlerManager::from_snapshot(decoded);
        assert_eq!(rebuilt.snapshot(), manager.snapshot());
        assert_eq!(rebuilt.live_handler_count(), 0);
    }

    #[test]
    fn bad_config_fails_at_first_use_not_registration() {
        let mut manager = StoreHandlerManager::new();
        // namespace doit être une chaîne : l'enregistrement passe quand même.
        manager
            .register_store_handler(
                HandlerType::Memory,
                json!({ "namespace": 42 }),
                &[ModelKind::Host],
            )
            .unwrap();

        let err = manager.get(Host::new("10.0.0.2")).unwrap_err();
        assert!(matches!(err, StoreError::HandlerConfig(_)));
    }

    #[test]
    fn get_strict_and_optional_modes() {
        let (mut manager, _) = manager_with_memory(&[ModelKind::Host]);

        assert!(matches!(
            manager.get(Host::new("10.0.0.2")),
            Err(StoreError::NotFound(_))
        ));
        let (_, exists) = manager.get_optional(Host::new("10.0.0.2")).unwrap();
        assert!(!exists);

        let mut host = Host::new("10.0.0.2");
        host.set_status(HostStatus::Investigating);
        manager.save(host).unwrap();

        let (read, exists) = manager.get_optional(Host::new("10.0.0.2")).unwrap();
        assert!(exists);
        assert_eq!(read.status(), Some(HostStatus::Investigating));
    }

    #[test]
    fn mapping_fields_round_trip_and_replace() {
        let (mut manager, _) = manager_with_memory(&[ModelKind::Cluster]);

        let mut cluster = Cluster::new("web");
        cluster.set_status("ok");
        cluster.add_member("10.0.0.2");
        cluster.add_member("10.0.0.3");
        manager.save(cluster).unwrap();

        let read = manager.get(Cluster::new("web")).unwrap();
        assert_eq!(
            read.hostset(),
            BTreeSet::from(["10.0.0.2".to_string(), "10.0.0.3".to_string()])
        );

        // Retirer un membre puis sauver : la sous-clé disparaît du store.
        let mut updated = read;
        updated.remove_member("10.0.0.3");
        manager.save(updated).unwrap();
        let read = manager.get(Cluster::new("web")).unwrap();
        assert_eq!(read.hostset(), BTreeSet::from(["10.0.0.2".to_string()]));
    }

    #[test]
    fn list_returns_populated_instances() {
        let (mut manager, _) = manager_with_memory(&[ModelKind::Host]);
        for (address, status) in [("10.0.0.2", HostStatus::Active), ("10.0.0.3", HostStatus::Failed)] {
            let mut host = Host::new(address);
            host.set_status(status);
            manager.save(host).unwrap();
        }

        let mut hosts = manager.list::<Host>().unwrap();
        hosts.sort_by_key(|h| h.address());
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].address(), "10.0.0.2");
        assert_eq!(hosts[0].status(), Some(HostStatus::Active));
        assert_eq!(hosts[1].status(), Some(HostStatus::Failed));
    }

    #[test]
    fn list_store_handlers_dedups_by_handler_type() {
        let (config_a, _) = memory_config();
        let (config_b, _) = memory_config();
        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(HandlerType::Memory, config_a, &[ModelKind::Host])
            .unwrap();
        manager
            .register_store_handler(
                HandlerType::Memory,
                config_b,
                &[ModelKind::Cluster, ModelKind::ClusterDeploy],
            )
            .unwrap();
        manager
            .register_store_handler(
                HandlerType::Etcd,
                json!({ "endpoint": "http://127.0.0.1:2379" }),
                &[ModelKind::ClusterRestart],
            )
            .unwrap();

        let handlers = manager.list_store_handlers().unwrap();
        assert_eq!(handlers.len(), 2);
    }

    #[test]
    fn container_managers_dedup_by_kind_first_registered_wins() {
        let (mut config_a, _) = memory_config();
        config_a["container_manager"] = json!({ "kind": "bogus", "server_url": "http://a" });
        let (mut config_b, _) = memory_config();
        config_b["container_manager"] = json!({ "kind": "bogus", "server_url": "http://b" });
        let (mut config_c, _) = memory_config();
        config_c["container_manager"] = json!({ "kind": "silly", "server_url": "http://c" });
        let (config_plain, _) = memory_config();

        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(HandlerType::Memory, config_a, &[ModelKind::Host])
            .unwrap();
        manager
            .register_store_handler(HandlerType::Memory, config_b, &[ModelKind::Cluster])
            .unwrap();
        manager
            .register_store_handler(HandlerType::Memory, config_c, &[ModelKind::ClusterDeploy])
            .unwrap();
        manager
            .register_store_handler(HandlerType::Memory, config_plain, &[ModelKind::ClusterRestart])
            .unwrap();

        let managers = manager.list_container_managers(None).unwrap();
        assert_eq!(managers.len(), 2);
        assert_eq!(managers[0].kind(), "bogus");
        assert_eq!(managers[1].kind(), "silly");

        let silly = manager.list_container_managers(Some("silly")).unwrap();
        assert_eq!(silly.len(), 1);

        let missing = manager.list_container_managers(Some("unknown")).unwrap();
        assert!(missing.is_empty());
    }
}
