/**
 * INVESTIGATOR - Worker d'investigation des nouveaux hôtes
 *
 * RÔLE : consomme une file d'items (snapshot de registre + attributs d'un
 * hôte), sonde chaque hôte en SSH et le fait avancer dans la machine à
 * états new -> investigating -> bootstrapping -> {active | failed}.
 *
 * FONCTIONNEMENT :
 * - chaque transition est persistée immédiatement : les pollers lisent un
 *   état à jour avant même la fin du travail distant
 * - un hôte défaillant est marqué failed et la boucle continue; rien ne
 *   doit tuer le worker
 * - mode run_once : traite exactement un item puis rend la main (tests)
 *
 * Le worker tourne dans son propre processus OS et reçoit un snapshot de
 * registre explicite, jamais d'état hérité du processus parent.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::Receiver;
use tracing::{info, warn};

use crate::models::{Host, HostStatus, ModelError};
use crate::oscmd::get_oscmd;
use crate::store::{RegistrySnapshot, StoreError, StoreHandlerManager};
use crate::transport::{RemoteHost, Transport};

/// Un item de travail : tout ce qu'il faut pour investiguer un hôte,
/// sans rien partager avec le processus émetteur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigateRequest {
    pub registry: RegistrySnapshot,
    pub host: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum InvestigatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Boucle principale du worker. Bloque sur la file; s'arrête quand la file
/// est fermée, ou après un item en mode run_once.
pub fn run(requests: &Receiver<InvestigateRequest>, transport: &dyn Transport, run_once: bool) {
    info!("investigator ready");
    loop {
        let request = match requests.recv() {
            Ok(request) => request,
            Err(_) => {
                info!("request queue closed, investigator stopping");
                return;
            }
        };

        // Un item raté ne termine jamais la boucle.
        if let Err(e) = investigate(request, transport) {
            warn!("investigation aborted on store error: {e}");
        }

        if run_once {
            return;
        }
    }
}

/// Marque l'hôte failed et persiste. Le worker continue derrière.
fn mark_failed(
    manager: &mut StoreHandlerManager,
    mut host: Host,
    reason: &str,
) -> Result<(), InvestigatorError> {
    warn!(address = %host.address(), "investigation failed: {reason}");
    host.set_status(HostStatus::Failed);
    host.touch_last_check();
    manager.save(host)?;
    Ok(())
}

/// Traite un item : probe, merge du profil, bootstrap, état final.
pub fn investigate(
    request: InvestigateRequest,
    transport: &dyn Transport,
) -> Result<(), InvestigatorError> {
    let mut manager = StoreHandlerManager::from_snapshot(request.registry);
    let mut host = Host::from_attrs(&request.host)?;
    info!(address = %host.address(), "investigating host");

    // Transition visible avant tout travail distant.
    host.set_status(HostStatus::Investigating);
    host.touch_last_check();
    let host = manager.save(host)?;

    let remote = match RemoteHost::from_host(&host) {
        Ok(remote) => remote,
        Err(e) => return mark_failed(&mut manager, host, &e.to_string()),
    };

    let profile = match transport.probe(&remote) {
        Ok(profile) => profile,
        Err(e) => return mark_failed(&mut manager, host, &e.to_string()),
    };

    let mut host = host;
    host.set_os(&profile.os);
    host.set_cpus(profile.cpus);
    host.set_memory(profile.memory);
    host.set_space(profile.space);
    host.set_status(HostStatus::Bootstrapping);
    host.touch_last_check();
    let mut host = manager.save(host)?;
    info!(address = %host.address(), os = %profile.os, "host profiled, bootstrapping");

    let oscmd = match get_oscmd(&profile.os) {
        Ok(oscmd) => oscmd,
        Err(e) => return mark_failed(&mut manager, host, &e.to_string()),
    };
    if let Err(e) = transport.run(&remote, &oscmd.bootstrap()) {
        return mark_failed(&mut manager, host, &e.to_string());
    }

    host.set_status(HostStatus::Active);
    host.touch_last_check();
    let host = manager.save(host)?;
    info!(address = %host.address(), "host active");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Model, ModelKind};
    use crate::store::HandlerType;
    use crate::transport::{HostProfile, TransportError};
    use serde_json::json;
    use std::sync::mpsc::channel;
    use uuid::Uuid;

    struct MockTransport {
        unreachable: Option<String>,
        profile: HostProfile,
        fail_bootstrap: bool,
    }

    impl MockTransport {
        fn healthy(os: &str) -> Self {
            Self {
                unreachable: None,
                profile: HostProfile {
                    os: os.to_string(),
                    cpus: 2,
                    memory: 11989228,
                    space: 487652,
                },
                fail_bootstrap: false,
            }
        }
    }

    impl Transport for MockTransport {
        fn probe(&self, host: &RemoteHost) -> Result<HostProfile, TransportError> {
            if self.unreachable.as_deref() == Some(host.address.as_str()) {
                return Err(TransportError::Unreachable {
                    address: host.address.clone(),
                    reason: "connection refused".into(),
                });
            }
            Ok(self.profile.clone())
        }

        fn run(&self, host: &RemoteHost, _commands: &[Vec<String>]) -> Result<(), TransportError> {
            if self.fail_bootstrap {
                return Err(TransportError::CommandFailed {
                    address: host.address.clone(),
                    detail: "install failed".into(),
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
                &[ModelKind::Host],
            )
            .unwrap();
        manager
    }

    fn request_for(manager: &StoreHandlerManager, address: &str) -> InvestigateRequest {
        InvestigateRequest {
            registry: manager.snapshot(),
            host: json!({
                "address": address,
                "status": "new",
                "ssh_priv_key": "dGVzdAo=",
                "remote_user": "root",
            }),
        }
    }

    #[test]
    fn successful_investigation_reaches_active() {
        let mut manager = test_manager();
        let transport = MockTransport::healthy("fedora");

        investigate(request_for(&manager, "10.0.0.2"), &transport).unwrap();

        let host = manager.get(Host::new("10.0.0.2")).unwrap();
        assert_eq!(host.status(), Some(HostStatus::Active));
        assert_eq!(host.os(), Some("fedora"));
        let secure = host.to_secure_json();
        assert_eq!(secure["cpus"], json!(2));
        assert_eq!(secure["memory"], json!(11989228));
        assert_eq!(secure["space"], json!(487652));
    }

    #[test]
    fn failed_probe_marks_host_failed_and_worker_continues() {
        let mut manager = test_manager();
        let transport = MockTransport {
            unreachable: Some("10.0.0.2".to_string()),
            ..MockTransport::healthy("atomic")
        };

        let (tx, rx) = channel();
        tx.send(request_for(&manager, "10.0.0.2")).unwrap();
        tx.send(request_for(&manager, "10.0.0.3")).unwrap();
        drop(tx); // la boucle s'arrête à la fermeture de la file

        run(&rx, &transport, false);

        let bad = manager.get(Host::new("10.0.0.2")).unwrap();
        assert_eq!(bad.status(), Some(HostStatus::Failed));

        // Le worker a survécu au premier hôte et traité le second.
        let good = manager.get(Host::new("10.0.0.3")).unwrap();
        assert_eq!(good.status(), Some(HostStatus::Active));
    }

    #[test]
    fn bootstrap_failure_marks_host_failed() {
        let mut manager = test_manager();
        let transport = MockTransport {
            fail_bootstrap: true,
            ..MockTransport::healthy("fedora")
        };

        investigate(request_for(&manager, "10.0.0.4"), &transport).unwrap();

        let host = manager.get(Host::new("10.0.0.4")).unwrap();
        assert_eq!(host.status(), Some(HostStatus::Failed));
        // Le profil sondé est conservé même en échec de bootstrap.
        assert_eq!(host.os(), Some("fedora"));
    }

    #[test]
    fn unknown_os_marks_host_failed() {
        let mut manager = test_manager();
        let transport = MockTransport::healthy("beos");

        investigate(request_for(&manager, "10.0.0.5"), &transport).unwrap();

        let host = manager.get(Host::new("10.0.0.5")).unwrap();
        assert_eq!(host.status(), Some(HostStatus::Failed));
    }

    #[test]
    fn run_once_processes_exactly_one_item() {
        let mut manager = test_manager();
        let transport = MockTransport::healthy("atomic");

        let (tx, rx) = channel();
        tx.send(request_for(&manager, "10.0.0.6")).unwrap();
        tx.send(request_for(&manager, "10.0.0.7")).unwrap();

        run(&rx, &transport, true);

        let first = manager.get(Host::new("10.0.0.6")).unwrap();
        assert_eq!(first.status(), Some(HostStatus::Active));
        // Le second item est resté en file.
        assert!(rx.try_recv().is_ok());
        assert!(matches!(
            manager.get(Host::new("10.0.0.7")),
            Err(StoreError::NotFound(_))
        ));
    }
}
