/**
 * ARMADA KERNEL - Point d'entrée principal du service Armada
 *
 * RÔLE : Orchestration de tous les modules : config, store manager,
 * investigation des hôtes, opérations cluster, pool de jobs.
 *
 * ARCHITECTURE : un processus kernel + des workers isolés dans leurs
 * propres processus OS (investigator long vécu, un worker par opération
 * cluster). Les workers reçoivent un snapshot de registre explicite et se
 * reconnectent au store de leur côté.
 */

mod clusterexec;
mod clusters;
mod config;
mod containermgr;
mod fields;
mod investigator;
mod jobs;
mod models;
mod oscmd;
mod state;
mod store;
mod supervisor;
mod transport;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::jobs::JobPool;
use crate::models::{Host, HostStatus};
use crate::store::StoreHandlerManager;
use crate::supervisor::InvestigatorHandle;

fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Les processus workers réutilisent ce binaire avec ARMADA_WORKER posé.
    if let Some(mode) = supervisor::worker_mode() {
        let cfg = config::load_config();
        return supervisor::run_worker(&mode, &cfg);
    }

    kernel()
}

#[tokio::main]
async fn kernel() -> anyhow::Result<()> {
    let cfg = config::load_config();
    let manager = config::build_manager(&cfg)?;

    // Worker d'investigation, hors processus dès le départ.
    let investigator = Arc::new(InvestigatorHandle::spawn()?);

    // Pool de jobs courts, borné aux CPUs sauf config contraire.
    let jobs = match cfg.jobs.workers {
        Some(count) => JobPool::with_workers(count),
        None => JobPool::new(),
    };
    info!("job pool ready ({} workers)", jobs.worker_count());

    // Sanity check du store en arrière-plan, hors du chemin de démarrage.
    let check_cfg = cfg.clone();
    jobs.submit_with_callback(
        move || {
            let mut manager = config::build_manager(&check_cfg)?;
            Ok::<usize, crate::store::StoreError>(manager.list_store_handlers()?.len())
        },
        |result| match result {
            Ok(count) => info!("store reachable ({count} unique handlers)"),
            Err(e) => warn!("store check failed: {e}"),
        },
    )?;

    spawn_admission_sweeper(manager.clone(), Arc::clone(&investigator));
    spawn_liveness_monitor(Arc::clone(&investigator));

    info!("armada kernel ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    investigator.stop();
    drop(jobs);
    Ok(())
}

/// Balaye périodiquement la collection des hôtes et soumet à
/// l'investigation ceux encore en statut new. Les soumissions sont
/// fire-and-forget; le worker persiste les transitions de son côté.
fn spawn_admission_sweeper(manager: StoreHandlerManager, investigator: Arc<InvestigatorHandle>) {
    std::thread::spawn(move || {
        let mut manager = manager;
        let mut submitted: HashSet<String> = HashSet::new();
        loop {
            std::thread::sleep(Duration::from_secs(30));

            let hosts = match manager.list::<Host>() {
                Ok(hosts) => hosts,
                Err(e) => {
                    warn!("host sweep failed: {e}");
                    continue;
                }
            };

            for host in hosts {
                let address = host.address();
                if host.status() == Some(HostStatus::New) && !submitted.contains(&address) {
                    match investigator.submit(&manager, &host) {
                        Ok(()) => {
                            info!(address = %address, "host submitted for investigation");
                            submitted.insert(address);
                        }
                        Err(e) => warn!(address = %address, "submission failed: {e}"),
                    }
                }
            }
        }
    });
}

/// Surveille la vivacité du processus investigator.
fn spawn_liveness_monitor(investigator: Arc<InvestigatorHandle>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if !investigator.is_alive() {
                warn!("investigator process is not alive");
            }
        }
    });
}
