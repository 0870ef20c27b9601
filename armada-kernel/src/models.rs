/**
 * MODELS - Entités persistables du kernel Armada
 *
 * RÔLE : Définition des modèles métier (Host, Cluster, opérations cluster)
 * et du trait Model qui les relie à la couche fields + au store manager.
 *
 * ARCHITECTURE : chaque modèle agrège des Fields nommés; tout accès passe
 * par les accesseurs typés du field, jamais en direct. render() concatène
 * les rendus de fields avec le préfixe de clé du record.
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use time::PrimitiveDateTime;

use crate::fields::{Caster, DateTimeField, DictField, FieldError, FieldOps, IntField, RenderedField, StrField};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("attributes for '{0}' must be a JSON object")]
    NotAnObject(&'static str),
    #[error("missing primary key '{0}'")]
    MissingPrimaryKey(&'static str),
}

/// Tag de type de modèle, clé du registre de store handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Host,
    Cluster,
    ClusterDeploy,
    ClusterRestart,
    ClusterUpgrade,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Host => "host",
            ModelKind::Cluster => "cluster",
            ModelKind::ClusterDeploy => "cluster_deploy",
            ModelKind::ClusterRestart => "cluster_restart",
            ModelKind::ClusterUpgrade => "cluster_upgrade",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comportement commun des modèles persistables. Object-safe : le store
/// manager dispatche sur `&dyn Model` sans connaître le type concret.
pub trait Model {
    fn kind(&self) -> ModelKind;
    fn key_template(&self) -> &'static str;
    fn collection_key(&self) -> &'static str;
    fn primary_key(&self) -> String;
    fn fields(&self) -> Vec<&dyn FieldOps>;
    fn fields_mut(&mut self) -> Vec<&mut dyn FieldOps>;

    /// Clé store du record, préfixe de toutes ses entrées.
    fn store_key(&self) -> String {
        self.key_template().replace("{}", &self.primary_key())
    }

    /// Rendu complet : concaténation des rendus de fields, préfixés.
    fn render(&self) -> Vec<RenderedField> {
        let prefix = self.store_key();
        let mut rendered = Vec::new();
        for field in self.fields() {
            for mut item in field.render() {
                item.key = format!("{}/{}", prefix, item.key);
                rendered.push(item);
            }
        }
        rendered
    }

    /// Vue JSON publique : les fields hidden sont exclus.
    fn to_public_json(&self) -> Value {
        let mut map = Map::new();
        for field in self.fields() {
            if !field.is_hidden() {
                map.insert(field.name().to_string(), field.json_value());
            }
        }
        Value::Object(map)
    }

    /// Vue JSON complète, credentials inclus. C'est cette forme qui
    /// transite vers les workers, jamais vers l'extérieur.
    fn to_secure_json(&self) -> Value {
        let mut map = Map::new();
        for field in self.fields() {
            map.insert(field.name().to_string(), field.json_value());
        }
        Value::Object(map)
    }

    /// Affecte les fields depuis un objet JSON. Les clés inconnues sont
    /// ignorées, les valeurs passent par le cast du field.
    fn update_from_json(&mut self, value: &Value) -> Result<(), ModelError> {
        let Value::Object(map) = value else {
            return Err(ModelError::NotAnObject("model"));
        };
        for field in self.fields_mut() {
            if let Some(entry) = map.get(field.name()) {
                field.set_json(entry)?;
            }
        }
        Ok(())
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut dyn FieldOps> {
        self.fields_mut().into_iter().find(|f| f.name() == name)
    }
}

/// Constructeurs statiques, hors vtable (le manager en a besoin pour
/// reconstruire des instances lors d'un list).
pub trait ModelDef: Model + Sized {
    fn model_kind() -> ModelKind;
    fn collection() -> &'static str;
    fn with_primary_key(pk: &str) -> Self;
}

// ---------------------------------------------------------------------------
// Host

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    New,
    Investigating,
    Bootstrapping,
    Active,
    Failed,
    Disassociated,
    Deactivated,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::New => "new",
            HostStatus::Investigating => "investigating",
            HostStatus::Bootstrapping => "bootstrapping",
            HostStatus::Active => "active",
            HostStatus::Failed => "failed",
            HostStatus::Disassociated => "disassociated",
            HostStatus::Deactivated => "deactivated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" => Some(HostStatus::New),
            "investigating" => Some(HostStatus::Investigating),
            "bootstrapping" => Some(HostStatus::Bootstrapping),
            "active" => Some(HostStatus::Active),
            "failed" => Some(HostStatus::Failed),
            "disassociated" => Some(HostStatus::Disassociated),
            "deactivated" => Some(HostStatus::Deactivated),
            _ => None,
        }
    }
}

/// Un hôte de la flotte. Créé à l'enregistrement, mué par l'investigator
/// pendant le probing, jamais supprimé par le worker lui-même.
#[derive(Debug, Clone)]
pub struct Host {
    address: StrField,
    status: StrField,
    os: StrField,
    cpus: IntField,
    memory: IntField,
    space: IntField,
    last_check: DateTimeField,
    ssh_priv_key: StrField,
    remote_user: StrField,
}

impl Host {
    pub fn new(address: &str) -> Self {
        let mut host = Self {
            address: StrField::new("address"),
            status: StrField::new("status"),
            os: StrField::new("os"),
            cpus: IntField::new("cpus"),
            memory: IntField::new("memory"),
            space: IntField::new("space"),
            last_check: DateTimeField::new("last_check"),
            ssh_priv_key: StrField::hidden("ssh_priv_key"),
            remote_user: StrField::hidden("remote_user"),
        };
        host.address.set(address);
        host
    }

    /// Reconstruit un Host depuis des attributs JSON (forme secure).
    pub fn from_attrs(attrs: &Value) -> Result<Self, ModelError> {
        let address = attrs
            .get("address")
            .and_then(Value::as_str)
            .ok_or(ModelError::MissingPrimaryKey("address"))?;
        let mut host = Host::new(address);
        host.update_from_json(attrs)?;
        Ok(host)
    }

    pub fn address(&self) -> String {
        self.address.get().unwrap_or_default().to_string()
    }

    pub fn status(&self) -> Option<HostStatus> {
        self.status.get().and_then(HostStatus::parse)
    }

    pub fn set_status(&mut self, status: HostStatus) {
        self.status.set(status.as_str());
    }

    pub fn os(&self) -> Option<&str> {
        self.os.get()
    }

    pub fn set_os(&mut self, os: &str) {
        self.os.set(os);
    }

    pub fn set_cpus(&mut self, cpus: i64) {
        self.cpus.set(cpus);
    }

    pub fn set_memory(&mut self, memory: i64) {
        self.memory.set(memory);
    }

    pub fn set_space(&mut self, space: i64) {
        self.space.set(space);
    }

    pub fn touch_last_check(&mut self) {
        self.last_check.set_now();
    }

    pub fn ssh_priv_key(&self) -> Option<&str> {
        self.ssh_priv_key.get()
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.get()
    }
}

impl Model for Host {
    fn kind(&self) -> ModelKind { ModelKind::Host }
    fn key_template(&self) -> &'static str { "/armada/hosts/{}" }
    fn collection_key(&self) -> &'static str { "/armada/hosts" }

    fn primary_key(&self) -> String {
        self.address()
    }

    fn fields(&self) -> Vec<&dyn FieldOps> {
        vec![
            &self.address,
            &self.status,
            &self.os,
            &self.cpus,
            &self.memory,
            &self.space,
            &self.last_check,
            &self.ssh_priv_key,
            &self.remote_user,
        ]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldOps> {
        vec![
            &mut self.address,
            &mut self.status,
            &mut self.os,
            &mut self.cpus,
            &mut self.memory,
            &mut self.space,
            &mut self.last_check,
            &mut self.ssh_priv_key,
            &mut self.remote_user,
        ]
    }
}

impl ModelDef for Host {
    fn model_kind() -> ModelKind { ModelKind::Host }
    fn collection() -> &'static str { "/armada/hosts" }
    fn with_primary_key(pk: &str) -> Self { Host::new(pk) }
}

// ---------------------------------------------------------------------------
// Cluster

/// Résumé dérivé des membres, recalculé à chaque lecture. Jamais persisté.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCounts {
    pub total: u32,
    pub available: u32,
    pub unavailable: u32,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    name: StrField,
    status: StrField,
    // Une sous-clé par adresse membre; la valeur reste un simple compteur.
    hostset: DictField,
    /// Rempli par la couche clusters, pas un field.
    pub hosts: HostCounts,
}

impl Cluster {
    pub fn new(name: &str) -> Self {
        let mut cluster = Self {
            name: StrField::new("name"),
            status: StrField::new("status"),
            hostset: DictField::hidden("hostset").with_default_caster(Caster::Int),
            hosts: HostCounts::default(),
        };
        cluster.name.set(name);
        cluster
    }

    pub fn name(&self) -> String {
        self.name.get().unwrap_or_default().to_string()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.get()
    }

    pub fn set_status(&mut self, status: &str) {
        self.status.set(status);
    }

    /// Adresses membres du cluster.
    pub fn hostset(&self) -> BTreeSet<String> {
        self.hostset.keys().into_iter().collect()
    }

    pub fn set_hostset(&mut self, addresses: &BTreeSet<String>) {
        self.hostset.clear();
        for address in addresses {
            // La valeur 1 ne porte rien, seule la sous-clé compte.
            let _ = self.hostset.insert(address, Value::from(1));
        }
    }

    pub fn add_member(&mut self, address: &str) {
        let _ = self.hostset.insert(address, Value::from(1));
    }

    pub fn remove_member(&mut self, address: &str) {
        self.hostset.remove(address);
    }

    pub fn contains_member(&self, address: &str) -> bool {
        self.hostset.contains_key(address)
    }
}

impl Model for Cluster {
    fn kind(&self) -> ModelKind { ModelKind::Cluster }
    fn key_template(&self) -> &'static str { "/armada/clusters/{}" }
    fn collection_key(&self) -> &'static str { "/armada/clusters" }

    fn primary_key(&self) -> String {
        self.name()
    }

    fn fields(&self) -> Vec<&dyn FieldOps> {
        vec![&self.name, &self.status, &self.hostset]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldOps> {
        vec![&mut self.name, &mut self.status, &mut self.hostset]
    }

    /// La vue publique ajoute le résumé dérivé, le hostset reste masqué.
    fn to_public_json(&self) -> Value {
        let mut map = Map::new();
        for field in self.fields() {
            if !field.is_hidden() {
                map.insert(field.name().to_string(), field.json_value());
            }
        }
        map.insert(
            "hosts".to_string(),
            serde_json::to_value(&self.hosts).unwrap_or(Value::Null),
        );
        Value::Object(map)
    }
}

impl ModelDef for Cluster {
    fn model_kind() -> ModelKind { ModelKind::Cluster }
    fn collection() -> &'static str { "/armada/clusters" }
    fn with_primary_key(pk: &str) -> Self { Cluster::new(pk) }
}

// ---------------------------------------------------------------------------
// Opérations cluster : un record singleton par (cluster, opération)

macro_rules! operation_accessors {
    ($model:ident, $done_field:ident) => {
        impl $model {
            pub fn cluster_name(&self) -> String {
                self.name.get().unwrap_or_default().to_string()
            }

            pub fn status(&self) -> Option<&str> {
                self.status.get()
            }

            pub fn set_status(&mut self, status: &str) {
                self.status.set(status);
            }

            pub fn started_at(&self) -> Option<PrimitiveDateTime> {
                self.started_at.get()
            }

            pub fn mark_started(&mut self) {
                self.started_at.set_now();
            }

            pub fn finished_at(&self) -> Option<PrimitiveDateTime> {
                self.finished_at.get()
            }

            pub fn mark_finished(&mut self) {
                self.finished_at.set_now();
            }

            /// En cours tant que finished_at n'est pas posé.
            pub fn in_progress(&self) -> bool {
                self.started_at.is_set() && !self.finished_at.is_set()
            }

            /// Note le résultat par hôte ("ok" / "failed").
            pub fn mark_host(&mut self, address: &str, outcome: &str) {
                let _ = self.$done_field.insert(address, Value::from(outcome));
            }

            pub fn host_outcomes(&self) -> Vec<(String, String)> {
                self.$done_field
                    .entries()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                    .collect()
            }
        }
    };
}

/// Déploiement d'une version sur tous les membres d'un cluster.
#[derive(Debug, Clone)]
pub struct ClusterDeploy {
    name: StrField,
    status: StrField,
    version: StrField,
    deployed: DictField,
    started_at: DateTimeField,
    finished_at: DateTimeField,
}

impl ClusterDeploy {
    pub fn new(name: &str) -> Self {
        let mut op = Self {
            name: StrField::new("name"),
            status: StrField::new("status"),
            version: StrField::new("version"),
            deployed: DictField::new("deployed").with_default_caster(Caster::Str),
            started_at: DateTimeField::new("started_at"),
            finished_at: DateTimeField::new("finished_at"),
        };
        op.name.set(name);
        op
    }

    pub fn version(&self) -> Option<&str> {
        self.version.get()
    }

    pub fn set_version(&mut self, version: &str) {
        self.version.set(version);
    }
}

operation_accessors!(ClusterDeploy, deployed);

impl Model for ClusterDeploy {
    fn kind(&self) -> ModelKind { ModelKind::ClusterDeploy }
    fn key_template(&self) -> &'static str { "/armada/operations/{}/deploy" }
    fn collection_key(&self) -> &'static str { "/armada/operations" }

    fn primary_key(&self) -> String {
        self.cluster_name()
    }

    fn fields(&self) -> Vec<&dyn FieldOps> {
        vec![
            &self.name,
            &self.status,
            &self.version,
            &self.deployed,
            &self.started_at,
            &self.finished_at,
        ]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldOps> {
        vec![
            &mut self.name,
            &mut self.status,
            &mut self.version,
            &mut self.deployed,
            &mut self.started_at,
            &mut self.finished_at,
        ]
    }
}

impl ModelDef for ClusterDeploy {
    fn model_kind() -> ModelKind { ModelKind::ClusterDeploy }
    fn collection() -> &'static str { "/armada/operations" }
    fn with_primary_key(pk: &str) -> Self { ClusterDeploy::new(pk) }
}

/// Redémarrage coordonné des services sur tous les membres.
#[derive(Debug, Clone)]
pub struct ClusterRestart {
    name: StrField,
    status: StrField,
    restarted: DictField,
    started_at: DateTimeField,
    finished_at: DateTimeField,
}

impl ClusterRestart {
    pub fn new(name: &str) -> Self {
        let mut op = Self {
            name: StrField::new("name"),
            status: StrField::new("status"),
            restarted: DictField::new("restarted").with_default_caster(Caster::Str),
            started_at: DateTimeField::new("started_at"),
            finished_at: DateTimeField::new("finished_at"),
        };
        op.name.set(name);
        op
    }
}

operation_accessors!(ClusterRestart, restarted);

impl Model for ClusterRestart {
    fn kind(&self) -> ModelKind { ModelKind::ClusterRestart }
    fn key_template(&self) -> &'static str { "/armada/operations/{}/restart" }
    fn collection_key(&self) -> &'static str { "/armada/operations" }

    fn primary_key(&self) -> String {
        self.cluster_name()
    }

    fn fields(&self) -> Vec<&dyn FieldOps> {
        vec![
            &self.name,
            &self.status,
            &self.restarted,
            &self.started_at,
            &self.finished_at,
        ]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldOps> {
        vec![
            &mut self.name,
            &mut self.status,
            &mut self.restarted,
            &mut self.started_at,
            &mut self.finished_at,
        ]
    }
}

impl ModelDef for ClusterRestart {
    fn model_kind() -> ModelKind { ModelKind::ClusterRestart }
    fn collection() -> &'static str { "/armada/operations" }
    fn with_primary_key(pk: &str) -> Self { ClusterRestart::new(pk) }
}

/// Montée de version des paquets sur tous les membres.
#[derive(Debug, Clone)]
pub struct ClusterUpgrade {
    name: StrField,
    status: StrField,
    upgraded: DictField,
    started_at: DateTimeField,
    finished_at: DateTimeField,
}

impl ClusterUpgrade {
    pub fn new(name: &str) -> Self {
        let mut op = Self {
            name: StrField::new("name"),
            status: StrField::new("status"),
            upgraded: DictField::new("upgraded").with_default_caster(Caster::Str),
            started_at: DateTimeField::new("started_at"),
            finished_at: DateTimeField::new("finished_at"),
        };
        op.name.set(name);
        op
    }
}

operation_accessors!(ClusterUpgrade, upgraded);

impl Model for ClusterUpgrade {
    fn kind(&self) -> ModelKind { ModelKind::ClusterUpgrade }
    fn key_template(&self) -> &'static str { "/armada/operations/{}/upgrade" }
    fn collection_key(&self) -> &'static str { "/armada/operations" }

    fn primary_key(&self) -> String {
        self.cluster_name()
    }

    fn fields(&self) -> Vec<&dyn FieldOps> {
        vec![
            &self.name,
            &self.status,
            &self.upgraded,
            &self.started_at,
            &self.finished_at,
        ]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldOps> {
        vec![
            &mut self.name,
            &mut self.status,
            &mut self.upgraded,
            &mut self.started_at,
            &mut self.finished_at,
        ]
    }
}

impl ModelDef for ClusterUpgrade {
    fn model_kind() -> ModelKind { ModelKind::ClusterUpgrade }
    fn collection() -> &'static str { "/armada/operations" }
    fn with_primary_key(pk: &str) -> Self { ClusterUpgrade::new(pk) }
}
