/**
 * SUPERVISOR - Cycle de vie des processus workers
 *
 * RÔLE : lance et surveille les workers hors processus : l'investigator
 * (long vécu, file d'items sur son stdin) et les workers d'opérations
 * cluster (un processus par invocation, payload unique sur stdin).
 *
 * FONCTIONNEMENT :
 * - les workers sont le binaire kernel relancé avec ARMADA_WORKER posé;
 *   ils ne reçoivent qu'un snapshot de registre sérialisé, jamais d'état
 *   hérité du parent
 * - submit est fire-and-forget : une ligne JSON poussée dans le pipe
 * - stop ferme d'abord la file (arrêt propre), puis kill après timeout
 */

use std::io::{BufRead, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::clusterexec::{
    clusterexec, ClusterExecRequest, OperationError, OperationRequest, OperationSpawner,
};
use crate::config::ArmadaConfig;
use crate::investigator::{self, InvestigateRequest};
use crate::models::{Host, Model};
use crate::state::{new_state, Shared};
use crate::store::{RegistrySnapshot, StoreHandlerManager};
use crate::transport::SshTransport;

pub const WORKER_ENV: &str = "ARMADA_WORKER";
pub const WORKER_INVESTIGATOR: &str = "investigator";
pub const WORKER_CLUSTEREXEC: &str = "clusterexec";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unable to spawn worker process: {0}")]
    Spawn(String),
    #[error("worker is not running")]
    NotRunning,
    #[error("unable to submit work item: {0}")]
    Submit(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Handle du processus investigator côté kernel.
pub struct InvestigatorHandle {
    child: Shared<Option<Child>>,
    stdin: Shared<Option<ChildStdin>>,
}

impl InvestigatorHandle {
    /// Relance le binaire courant en mode investigator.
    pub fn spawn() -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe().map_err(|e| SupervisorError::Spawn(e.to_string()))?;
        let mut child = Command::new(exe)
            .env(WORKER_ENV, WORKER_INVESTIGATOR)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Spawn("worker stdin unavailable".into()))?;

        info!(pid = child.id(), "investigator process started");
        Ok(Self {
            child: new_state(Some(child)),
            stdin: new_state(Some(stdin)),
        })
    }

    /// Soumet un hôte à investiguer. Le worker ne reçoit que le registre
    /// sérialisé : il repart sans handler vivant et se reconnecte.
    pub fn submit(
        &self,
        manager: &StoreHandlerManager,
        host: &Host,
    ) -> Result<(), SupervisorError> {
        let request = InvestigateRequest {
            registry: manager.snapshot(),
            host: host.to_secure_json(),
        };
        let line = serde_json::to_string(&request)?;

        let mut guard = self.stdin.lock();
        let stdin = guard.as_mut().ok_or(SupervisorError::NotRunning)?;
        writeln!(stdin, "{line}").map_err(|e| SupervisorError::Submit(e.to_string()))?;
        stdin
            .flush()
            .map_err(|e| SupervisorError::Submit(e.to_string()))?;
        Ok(())
    }

    /// Vrai tant que le processus worker n'est pas terminé.
    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Arrêt : fermeture de la file d'abord (le worker finit son item et
    /// sort), kill en dernier recours après timeout.
    pub fn stop(&self) {
        self.stdin.lock().take();

        let mut guard = self.child.lock();
        let Some(mut child) = guard.take() else {
            return;
        };

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("investigator stopped ({status})");
                    return;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!("investigator did not stop in time, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("error while waiting for investigator: {e}");
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
            }
        }
    }
}

/// Lanceur de production : un processus par opération cluster.
pub struct ProcessSpawner;

impl OperationSpawner for ProcessSpawner {
    fn spawn(
        &self,
        snapshot: RegistrySnapshot,
        cluster: &str,
        request: &OperationRequest,
    ) -> Result<(), OperationError> {
        let exe =
            std::env::current_exe().map_err(|e| OperationError::Spawn(e.to_string()))?;
        let mut child = Command::new(exe)
            .env(WORKER_ENV, WORKER_CLUSTEREXEC)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| OperationError::Spawn(e.to_string()))?;

        let payload = ClusterExecRequest {
            registry: snapshot,
            cluster: cluster.to_string(),
            request: request.clone(),
        };
        let encoded = serde_json::to_string(&payload)
            .map_err(|e| OperationError::Spawn(e.to_string()))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| OperationError::Spawn("worker stdin unavailable".into()))?;
            stdin
                .write_all(encoded.as_bytes())
                .map_err(|e| OperationError::Spawn(e.to_string()))?;
        } // pipe fermé : le worker a tout ce qu'il lui faut

        info!(pid = child.id(), cluster, "operation worker started");

        // Collecte du code de sortie pour ne pas laisser de zombie; le
        // résultat métier, lui, est dans le record d'opération.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

/// Mode worker demandé via l'environnement, s'il y en a un.
pub fn worker_mode() -> Option<String> {
    std::env::var(WORKER_ENV).ok()
}

/// Point d'entrée des processus workers.
pub fn run_worker(mode: &str, config: &ArmadaConfig) -> anyhow::Result<()> {
    match mode {
        WORKER_INVESTIGATOR => run_investigator_worker(config),
        WORKER_CLUSTEREXEC => run_clusterexec_worker(config),
        other => anyhow::bail!("unknown worker mode '{other}'"),
    }
}

fn transport_from(config: &ArmadaConfig) -> SshTransport {
    SshTransport::new(config.ssh.connect_timeout_secs, config.ssh.command_timeout_secs)
}

/// Worker investigator : pompe les lignes JSON de stdin vers la file,
/// la boucle d'investigation consomme derrière.
fn run_investigator_worker(config: &ArmadaConfig) -> anyhow::Result<()> {
    let transport = transport_from(config);
    let (tx, rx) = std::sync::mpsc::channel();

    let reader = std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<InvestigateRequest>(&line) {
                Ok(request) => {
                    if tx.send(request).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("discarding malformed work item: {e}"),
            }
        }
        // tx tombe ici : la file se ferme, la boucle s'arrête proprement.
    });

    investigator::run(&rx, &transport, false);
    let _ = reader.join();
    Ok(())
}

/// Worker d'opération : un payload unique sur stdin, exécution, sortie.
fn run_clusterexec_worker(config: &ArmadaConfig) -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let payload: ClusterExecRequest = serde_json::from_str(input.trim())?;

    let mut manager = StoreHandlerManager::from_snapshot(payload.registry);
    let transport = transport_from(config);
    clusterexec(&mut manager, &payload.cluster, &payload.request, &transport)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clusterexec_payload_round_trips_as_json() {
        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(
                crate::store::HandlerType::Memory,
                json!({ "namespace": "payload-test" }),
                &[crate::models::ModelKind::Cluster],
            )
            .unwrap();

        let payload = ClusterExecRequest {
            registry: manager.snapshot(),
            cluster: "web".into(),
            request: OperationRequest::Deploy { version: "7.2.6".into() },
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: ClusterExecRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.cluster, "web");
        assert_eq!(decoded.request, OperationRequest::Deploy { version: "7.2.6".into() });
        assert_eq!(decoded.registry, manager.snapshot());
    }
}
