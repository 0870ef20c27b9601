/**
 * CLUSTEREXEC - Orchestration des opérations cluster longues
 *
 * RÔLE : initiation idempotente et suivi des opérations deploy / restart /
 * upgrade. Un record singleton par (cluster, opération); "en cours" tant
 * que finished_at n'est pas posé.
 *
 * FONCTIONNEMENT :
 * - initiate : NotFound si le cluster n'existe pas; si un record est en
 *   cours, acceptation idempotente (même demande) ou conflit (demande
 *   incompatible, ex: autre version de deploy); sinon un worker est lancé
 *   dans son propre processus et un record frais est persisté
 * - status : NoContent si aucune opération n'a jamais tourné (état idle,
 *   pas une erreur), sinon le record courant
 * - clusterexec : corps du worker; déroule la commande OS sur chaque membre
 *   du cluster, note le résultat par hôte, puis écrit l'état terminal
 *
 * Un worker qui meurt avant d'écrire finished_at laisse le record en
 * in_process; la réparation est manuelle.
 */

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clusters::cluster_exists;
use crate::models::{
    Cluster, ClusterDeploy, ClusterRestart, ClusterUpgrade, Host, HostStatus, Model, ModelDef,
};
use crate::oscmd::{get_oscmd, OsCmd, OsCmdError};
use crate::store::{RegistrySnapshot, StoreError, StoreHandlerManager};
use crate::transport::{RemoteHost, Transport};

pub const STATUS_IN_PROCESS: &str = "in_process";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unable to launch operation worker: {0}")]
    Spawn(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deploy,
    Restart,
    Upgrade,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deploy => "deploy",
            OperationKind::Restart => "restart",
            OperationKind::Upgrade => "upgrade",
        }
    }
}

/// Une demande d'opération; deploy porte sa version cible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationRequest {
    Deploy { version: String },
    Restart,
    Upgrade,
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Deploy { .. } => OperationKind::Deploy,
            OperationRequest::Restart => OperationKind::Restart,
            OperationRequest::Upgrade => OperationKind::Upgrade,
        }
    }
}

/// Record d'opération, quel que soit son type concret.
#[derive(Debug)]
pub enum OperationRecord {
    Deploy(ClusterDeploy),
    Restart(ClusterRestart),
    Upgrade(ClusterUpgrade),
}

impl OperationRecord {
    pub fn status(&self) -> Option<String> {
        match self {
            OperationRecord::Deploy(r) => r.status().map(str::to_string),
            OperationRecord::Restart(r) => r.status().map(str::to_string),
            OperationRecord::Upgrade(r) => r.status().map(str::to_string),
        }
    }

    pub fn in_progress(&self) -> bool {
        match self {
            OperationRecord::Deploy(r) => r.in_progress(),
            OperationRecord::Restart(r) => r.in_progress(),
            OperationRecord::Upgrade(r) => r.in_progress(),
        }
    }

    /// Version cible, pour les deploys uniquement.
    pub fn version(&self) -> Option<String> {
        match self {
            OperationRecord::Deploy(r) => r.version().map(str::to_string),
            _ => None,
        }
    }

    pub fn to_public_json(&self) -> serde_json::Value {
        match self {
            OperationRecord::Deploy(r) => r.to_public_json(),
            OperationRecord::Restart(r) => r.to_public_json(),
            OperationRecord::Upgrade(r) => r.to_public_json(),
        }
    }
}

/// Réponse d'initiation/statut, à mapper sur les codes HTTP par la couche
/// au-dessus (201/200/409/204/404).
#[derive(Debug)]
pub enum OperationResponse {
    Created(OperationRecord),
    AlreadyInProgress(OperationRecord),
    Conflict(OperationRecord),
    Current(OperationRecord),
    NoContent,
    NotFound,
}

/// Lancement du worker d'opération. Le processus ne reçoit qu'un snapshot
/// de registre et la demande, jamais d'état hérité.
pub trait OperationSpawner: Send + Sync {
    fn spawn(
        &self,
        snapshot: RegistrySnapshot,
        cluster: &str,
        request: &OperationRequest,
    ) -> Result<(), OperationError>;
}

/// Payload transmis au processus worker sur son stdin.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterExecRequest {
    pub registry: RegistrySnapshot,
    pub cluster: String,
    pub request: OperationRequest,
}

/// Accès uniforme aux trois types de records d'opération.
trait OpRecord: ModelDef {
    fn op_in_progress(&self) -> bool;
    fn op_begin(&mut self);
    fn op_finish(&mut self, succeeded: bool);
    fn op_mark_host(&mut self, address: &str, outcome: &str);
    fn wrap(self) -> OperationRecord;
}

macro_rules! op_record {
    ($model:ident, $variant:ident) => {
        impl OpRecord for $model {
            fn op_in_progress(&self) -> bool {
                self.in_progress()
            }

            fn op_begin(&mut self) {
                self.set_status(STATUS_IN_PROCESS);
                self.mark_started();
            }

            fn op_finish(&mut self, succeeded: bool) {
                self.set_status(if succeeded { STATUS_SUCCEEDED } else { STATUS_FAILED });
                self.mark_finished();
            }

            fn op_mark_host(&mut self, address: &str, outcome: &str) {
                self.mark_host(address, outcome);
            }

            fn wrap(self) -> OperationRecord {
                OperationRecord::$variant(self)
            }
        }
    };
}

op_record!(ClusterDeploy, Deploy);
op_record!(ClusterRestart, Restart);
op_record!(ClusterUpgrade, Upgrade);

fn initiate_kind<M: OpRecord>(
    manager: &mut StoreHandlerManager,
    spawner: &dyn OperationSpawner,
    name: &str,
    request: &OperationRequest,
    same_request: impl Fn(&M) -> bool,
    prepare: impl Fn(&mut M),
) -> Result<OperationResponse, OperationError> {
    let (record, exists) = manager.get_optional(M::with_primary_key(name))?;
    if exists && record.op_in_progress() {
        if same_request(&record) {
            info!(cluster = name, "operation already in progress, same request");
            return Ok(OperationResponse::AlreadyInProgress(record.wrap()));
        }
        warn!(cluster = name, "conflicting operation request while in progress");
        return Ok(OperationResponse::Conflict(record.wrap()));
    }

    // Le snapshot est l'équivalent inter-processus du clone : même
    // registre, aucun handler vivant.
    spawner.spawn(manager.snapshot(), name, request)?;

    let mut fresh = M::with_primary_key(name);
    fresh.op_begin();
    prepare(&mut fresh);
    let fresh = manager.save(fresh)?;
    info!(cluster = name, kind = request.kind().as_str(), "operation started");
    Ok(OperationResponse::Created(fresh.wrap()))
}

/// Initie une opération ("PUT"). Idempotent sur demande identique,
/// conflit sur demande incompatible.
pub fn initiate(
    manager: &mut StoreHandlerManager,
    spawner: &dyn OperationSpawner,
    name: &str,
    request: &OperationRequest,
) -> Result<OperationResponse, OperationError> {
    if !cluster_exists(manager, name)? {
        info!(cluster = name, "operation requested for unknown cluster");
        return Ok(OperationResponse::NotFound);
    }

    match request {
        OperationRequest::Deploy { version } => initiate_kind::<ClusterDeploy>(
            manager,
            spawner,
            name,
            request,
            |record| record.version() == Some(version.as_str()),
            |record| record.set_version(version),
        ),
        OperationRequest::Restart => initiate_kind::<ClusterRestart>(
            manager,
            spawner,
            name,
            request,
            |_| true,
            |_| {},
        ),
        OperationRequest::Upgrade => initiate_kind::<ClusterUpgrade>(
            manager,
            spawner,
            name,
            request,
            |_| true,
            |_| {},
        ),
    }
}

fn status_kind<M: OpRecord>(
    manager: &mut StoreHandlerManager,
    name: &str,
) -> Result<OperationResponse, OperationError> {
    let (record, exists) = manager.get_optional(M::with_primary_key(name))?;
    if !exists {
        // Aucun historique : état idle, pas une erreur.
        return Ok(OperationResponse::NoContent);
    }
    Ok(OperationResponse::Current(record.wrap()))
}

/// Statut courant d'une opération ("GET").
pub fn status(
    manager: &mut StoreHandlerManager,
    name: &str,
    kind: OperationKind,
) -> Result<OperationResponse, OperationError> {
    if !cluster_exists(manager, name)? {
        return Ok(OperationResponse::NotFound);
    }
    match kind {
        OperationKind::Deploy => status_kind::<ClusterDeploy>(manager, name),
        OperationKind::Restart => status_kind::<ClusterRestart>(manager, name),
        OperationKind::Upgrade => status_kind::<ClusterUpgrade>(manager, name),
    }
}

/// Déroule les commandes sur un hôte. Retourne la cause en cas d'échec.
fn run_on_host(
    manager: &mut StoreHandlerManager,
    address: &str,
    commands_for: &impl Fn(&'static dyn OsCmd) -> Result<Vec<Vec<String>>, OsCmdError>,
    transport: &dyn Transport,
) -> Result<(), String> {
    let host = manager
        .get(Host::new(address))
        .map_err(|e| e.to_string())?;
    let os = host.os().ok_or("host has no probed os")?.to_string();
    let oscmd = get_oscmd(&os).map_err(|e| e.to_string())?;
    let commands = commands_for(oscmd).map_err(|e| e.to_string())?;
    let remote = RemoteHost::from_host(&host).map_err(|e| e.to_string())?;
    transport.run(&remote, &commands).map_err(|e| e.to_string())
}

fn exec_kind<M: OpRecord>(
    manager: &mut StoreHandlerManager,
    name: &str,
    transport: &dyn Transport,
    prepare: impl Fn(&mut M),
    commands_for: impl Fn(&'static dyn OsCmd) -> Result<Vec<Vec<String>>, OsCmdError>,
) -> Result<(), OperationError> {
    // Le worker peut démarrer avant que l'initiateur ait persisté son
    // record : on reprend l'existant ou on en ouvre un frais.
    let (mut record, exists) = manager.get_optional(M::with_primary_key(name))?;
    if !exists || !record.op_in_progress() {
        record = M::with_primary_key(name);
        record.op_begin();
        prepare(&mut record);
    }
    let mut record = manager.save(record)?;

    let cluster = match manager.get(Cluster::new(name)) {
        Ok(cluster) => cluster,
        Err(e) => {
            record.op_finish(false);
            manager.save(record)?;
            return Err(e.into());
        }
    };

    let mut all_ok = true;
    for address in cluster.hostset() {
        match run_on_host(manager, &address, &commands_for, transport) {
            Ok(()) => {
                record.op_mark_host(&address, "ok");
                info!(cluster = name, address = %address, "operation step done");
            }
            Err(reason) => {
                all_ok = false;
                record.op_mark_host(&address, "failed");
                warn!(cluster = name, address = %address, "operation step failed: {reason}");
                // L'hôte fautif est sorti du service.
                if let Ok((mut host, true)) = manager.get_optional(Host::new(&address)) {
                    host.set_status(HostStatus::Failed);
                    host.touch_last_check();
                    let _ = manager.save(host);
                }
            }
        }
        // Progrès par hôte visible des pollers.
        record = manager.save(record)?;
    }

    record.op_finish(all_ok);
    manager.save(record)?;
    info!(cluster = name, succeeded = all_ok, "operation finished");
    Ok(())
}

/// Corps du worker d'opération : fan-out de l'action sur chaque membre du
/// cluster, puis écriture de l'état terminal via le manager cloné.
pub fn clusterexec(
    manager: &mut StoreHandlerManager,
    name: &str,
    request: &OperationRequest,
    transport: &dyn Transport,
) -> Result<(), OperationError> {
    match request {
        OperationRequest::Deploy { version } => {
            let version = version.clone();
            exec_kind::<ClusterDeploy>(
                manager,
                name,
                transport,
                |record| record.set_version(&version),
                |oscmd| oscmd.deploy(&version),
            )
        }
        OperationRequest::Restart => exec_kind::<ClusterRestart>(
            manager,
            name,
            transport,
            |_| {},
            |oscmd| Ok(oscmd.restart()),
        ),
        OperationRequest::Upgrade => exec_kind::<ClusterUpgrade>(
            manager,
            name,
            transport,
            |_| {},
            |oscmd| Ok(oscmd.upgrade()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;
    use crate::store::HandlerType;
    use crate::transport::{HostProfile, TransportError};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    struct CountingSpawner {
        count: Mutex<u32>,
    }

    impl CountingSpawner {
        fn new() -> Self {
            Self { count: Mutex::new(0) }
        }

        fn spawned(&self) -> u32 {
            *self.count.lock()
        }
    }

    impl OperationSpawner for CountingSpawner {
        fn spawn(
            &self,
            _snapshot: RegistrySnapshot,
            _cluster: &str,
            _request: &OperationRequest,
        ) -> Result<(), OperationError> {
            *self.count.lock() += 1;
            Ok(())
        }
    }

    struct MockTransport {
        fail_for: Option<String>,
    }

    impl Transport for MockTransport {
        fn probe(&self, _host: &RemoteHost) -> Result<HostProfile, TransportError> {
            unreachable!("operation workers never probe");
        }

        fn run(&self, host: &RemoteHost, _commands: &[Vec<String>]) -> Result<(), TransportError> {
            if self.fail_for.as_deref() == Some(host.address.as_str()) {
                return Err(TransportError::CommandFailed {
                    address: host.address.clone(),
                    detail: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn test_manager() -> StoreHandlerManager {
        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(
                HandlerType::Memory,
                json!({ "namespace": Uuid::new_v4().to_string() }),
                &[
                    ModelKind::Host,
                    ModelKind::Cluster,
                    ModelKind::ClusterDeploy,
                    ModelKind::ClusterRestart,
                    ModelKind::ClusterUpgrade,
                ],
            )
            .unwrap();
        manager
    }

    fn seed_cluster(manager: &mut StoreHandlerManager, name: &str, members: &[&str]) {
        let mut cluster = Cluster::new(name);
        cluster.set_status("ok");
        cluster.set_hostset(&members.iter().map(|m| m.to_string()).collect::<BTreeSet<_>>());
        manager.save(cluster).unwrap();

        for member in members {
            let mut host = Host::from_attrs(&json!({
                "address": member,
                "status": "active",
                "os": "atomic",
                "ssh_priv_key": "dGVzdAo=",
                "remote_user": "root",
            }))
            .unwrap();
            host.touch_last_check();
            manager.save(host).unwrap();
        }
    }

    fn deploy(version: &str) -> OperationRequest {
        OperationRequest::Deploy { version: version.to_string() }
    }

    #[test]
    fn initiate_on_unknown_cluster_is_not_found() {
        let mut manager = test_manager();
        let spawner = CountingSpawner::new();
        let response = initiate(&mut manager, &spawner, "ghost", &deploy("7.2.6")).unwrap();
        assert!(matches!(response, OperationResponse::NotFound));
        assert_eq!(spawner.spawned(), 0);
    }

    #[test]
    fn initiate_creates_record_and_spawns_worker() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2"]);
        let spawner = CountingSpawner::new();

        let response = initiate(&mut manager, &spawner, "web", &deploy("7.2.6")).unwrap();
        let OperationResponse::Created(record) = response else {
            panic!("expected Created");
        };
        assert!(record.in_progress());
        assert_eq!(record.version().as_deref(), Some("7.2.6"));
        assert_eq!(spawner.spawned(), 1);

        let stored = manager.get(ClusterDeploy::new("web")).unwrap();
        assert_eq!(stored.status(), Some(STATUS_IN_PROCESS));
        assert!(stored.in_progress());
    }

    #[test]
    fn same_version_while_in_flight_is_idempotent() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2"]);
        let spawner = CountingSpawner::new();
        initiate(&mut manager, &spawner, "web", &deploy("7.2.6")).unwrap();
        let before = manager.get(ClusterDeploy::new("web")).unwrap().to_public_json();

        let response = initiate(&mut manager, &spawner, "web", &deploy("7.2.6")).unwrap();
        assert!(matches!(response, OperationResponse::AlreadyInProgress(_)));
        // Pas de second worker, record intact.
        assert_eq!(spawner.spawned(), 1);
        let after = manager.get(ClusterDeploy::new("web")).unwrap().to_public_json();
        assert_eq!(before, after);
    }

    #[test]
    fn different_version_while_in_flight_conflicts() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2"]);
        let spawner = CountingSpawner::new();
        initiate(&mut manager, &spawner, "web", &deploy("7.2.6")).unwrap();

        let response = initiate(&mut manager, &spawner, "web", &deploy("7.3.0")).unwrap();
        let OperationResponse::Conflict(record) = response else {
            panic!("expected Conflict");
        };
        // Le record renvoyé et le record stocké restent sur la version en vol.
        assert_eq!(record.version().as_deref(), Some("7.2.6"));
        let stored = manager.get(ClusterDeploy::new("web")).unwrap();
        assert_eq!(stored.version(), Some("7.2.6"));
        assert_eq!(spawner.spawned(), 1);
    }

    #[test]
    fn finished_record_allows_a_new_run() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2"]);
        let spawner = CountingSpawner::new();
        initiate(&mut manager, &spawner, "web", &deploy("7.2.6")).unwrap();

        // Terminer l'opération à la main.
        let mut record = manager.get(ClusterDeploy::new("web")).unwrap();
        record.set_status(STATUS_SUCCEEDED);
        record.mark_finished();
        manager.save(record).unwrap();

        let response = initiate(&mut manager, &spawner, "web", &deploy("7.3.0")).unwrap();
        assert!(matches!(response, OperationResponse::Created(_)));
        assert_eq!(spawner.spawned(), 2);
        let stored = manager.get(ClusterDeploy::new("web")).unwrap();
        assert_eq!(stored.version(), Some("7.3.0"));
        assert!(stored.in_progress());
    }

    #[test]
    fn restart_in_flight_is_idempotent_without_parameters() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2"]);
        let spawner = CountingSpawner::new();
        initiate(&mut manager, &spawner, "web", &OperationRequest::Restart).unwrap();

        let response =
            initiate(&mut manager, &spawner, "web", &OperationRequest::Restart).unwrap();
        assert!(matches!(response, OperationResponse::AlreadyInProgress(_)));
        assert_eq!(spawner.spawned(), 1);
    }

    #[test]
    fn status_reports_idle_as_no_content() {
        let mut manager = test_manager();
        assert!(matches!(
            status(&mut manager, "ghost", OperationKind::Deploy).unwrap(),
            OperationResponse::NotFound
        ));

        seed_cluster(&mut manager, "web", &["10.0.0.2"]);
        assert!(matches!(
            status(&mut manager, "web", OperationKind::Deploy).unwrap(),
            OperationResponse::NoContent
        ));

        let spawner = CountingSpawner::new();
        initiate(&mut manager, &spawner, "web", &deploy("7.2.6")).unwrap();
        let OperationResponse::Current(record) =
            status(&mut manager, "web", OperationKind::Deploy).unwrap()
        else {
            panic!("expected Current");
        };
        assert!(record.in_progress());
    }

    #[test]
    fn worker_fans_out_and_writes_terminal_success() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2", "10.0.0.3"]);
        let transport = MockTransport { fail_for: None };

        let mut worker_manager = manager.clone();
        clusterexec(&mut worker_manager, "web", &OperationRequest::Restart, &transport).unwrap();

        let record = manager.get(ClusterRestart::new("web")).unwrap();
        assert_eq!(record.status(), Some(STATUS_SUCCEEDED));
        assert!(!record.in_progress());
        assert!(record.finished_at().is_some());
        let outcomes = record.host_outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| outcome == "ok"));
    }

    #[test]
    fn worker_failure_on_one_host_fails_operation_but_finishes() {
        let mut manager = test_manager();
        seed_cluster(&mut manager, "web", &["10.0.0.2", "10.0.0.3"]);
        let transport = MockTransport { fail_for: Some("10.0.0.2".to_string()) };

        let mut worker_manager = manager.clone();
        clusterexec(&mut worker_manager, "web", &deploy("7.2.6"), &transport).unwrap();

        let record = manager.get(ClusterDeploy::new("web")).unwrap();
        assert_eq!(record.status(), Some(STATUS_FAILED));
        assert!(record.finished_at().is_some());

        let outcomes = record.host_outcomes();
        assert!(outcomes.contains(&("10.0.0.2".to_string(), "failed".to_string())));
        assert!(outcomes.contains(&("10.0.0.3".to_string(), "ok".to_string())));

        // L'hôte fautif est marqué failed, l'autre reste actif.
        let bad = manager.get(Host::new("10.0.0.2")).unwrap();
        assert_eq!(bad.status(), Some(HostStatus::Failed));
        let good = manager.get(Host::new("10.0.0.3")).unwrap();
        assert_eq!(good.status(), Some(HostStatus::Active));
    }
}
