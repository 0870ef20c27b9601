/**
 * CLUSTERS - Logique d'appartenance et lectures dérivées
 *
 * RÔLE : opérations sur les clusters au-dessus du store manager :
 * existence, résumé dérivé des membres (recalculé à chaque lecture, jamais
 * persisté), remplacement optimiste du hostset, ajout/retrait idempotent
 * d'un membre.
 */

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::models::{Cluster, Host, HostStatus};
use crate::store::{StoreError, StoreHandlerManager};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster '{0}' does not exist")]
    NotFound(String),
    #[error("hostset for cluster '{0}' does not match the expected set")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn cluster_exists(manager: &mut StoreHandlerManager, name: &str) -> Result<bool, StoreError> {
    let (_, exists) = manager.get_optional(Cluster::new(name))?;
    Ok(exists)
}

/// Création idempotente : recréer un cluster existant le laisse intact.
pub fn create_cluster(manager: &mut StoreHandlerManager, name: &str) -> Result<Cluster, ClusterError> {
    let (existing, exists) = manager.get_optional(Cluster::new(name))?;
    if exists {
        info!(cluster = name, "creation requested for existing cluster");
        return Ok(existing);
    }
    let mut cluster = Cluster::new(name);
    cluster.set_status("ok");
    let cluster = manager.save(cluster)?;
    info!(cluster = name, "cluster created");
    Ok(cluster)
}

/// Recalcule le résumé dérivé en croisant la collection des hosts.
/// Ce résumé n'est jamais persisté.
pub fn calculate_hosts(
    manager: &mut StoreHandlerManager,
    cluster: &mut Cluster,
) -> Result<(), StoreError> {
    let hosts = manager.list::<Host>()?;

    let mut total = 0u32;
    let mut available = 0u32;
    let mut unavailable = 0u32;
    for host in &hosts {
        if cluster.contains_member(&host.address()) {
            total += 1;
            if host.status() == Some(HostStatus::Active) {
                available += 1;
            } else {
                unavailable += 1;
            }
        }
    }

    cluster.hosts.total = total;
    cluster.hosts.available = available;
    cluster.hosts.unavailable = unavailable;
    Ok(())
}

/// Lecture complète d'un cluster, résumé dérivé inclus.
pub fn retrieve_cluster(
    manager: &mut StoreHandlerManager,
    name: &str,
) -> Result<Cluster, ClusterError> {
    let (mut cluster, exists) = manager.get_optional(Cluster::new(name))?;
    if !exists {
        return Err(ClusterError::NotFound(name.to_string()));
    }
    calculate_hosts(manager, &mut cluster)?;
    Ok(cluster)
}

/// Remplace le hostset entier, sous contrôle de concurrence optimiste :
/// l'écriture n'a lieu que si le set stocké vaut exactement `old`.
// TODO: écrire conditionnellement sur le modifiedIndex etcd pour fermer la
// fenêtre entre lecture et écriture.
pub fn replace_hostset(
    manager: &mut StoreHandlerManager,
    name: &str,
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
) -> Result<Cluster, ClusterError> {
    let (mut cluster, exists) = manager.get_optional(Cluster::new(name))?;
    if !exists {
        return Err(ClusterError::NotFound(name.to_string()));
    }

    let current = cluster.hostset();
    if current != *old {
        debug!(cluster = name, ?current, expected = ?old, "hostset mismatch");
        return Err(ClusterError::Conflict(name.to_string()));
    }

    cluster.set_hostset(new);
    let mut cluster = manager.save(cluster)?;
    info!(cluster = name, members = new.len(), "hostset replaced");
    calculate_hosts(manager, &mut cluster)?;
    Ok(cluster)
}

/// Ajoute un membre, idempotent.
pub fn add_host(
    manager: &mut StoreHandlerManager,
    name: &str,
    address: &str,
) -> Result<(), ClusterError> {
    let (mut cluster, exists) = manager.get_optional(Cluster::new(name))?;
    if !exists {
        return Err(ClusterError::NotFound(name.to_string()));
    }
    if cluster.contains_member(address) {
        return Ok(());
    }
    cluster.add_member(address);
    manager.save(cluster)?;
    info!(cluster = name, address, "host added to cluster");
    Ok(())
}

/// Retire un membre, idempotent.
pub fn remove_host(
    manager: &mut StoreHandlerManager,
    name: &str,
    address: &str,
) -> Result<(), ClusterError> {
    let (mut cluster, exists) = manager.get_optional(Cluster::new(name))?;
    if !exists {
        return Err(ClusterError::NotFound(name.to_string()));
    }
    if !cluster.contains_member(address) {
        return Ok(());
    }
    cluster.remove_member(address);
    manager.save(cluster)?;
    info!(cluster = name, address, "host removed from cluster");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;
    use crate::store::HandlerType;
    use serde_json::json;
    use uuid::Uuid;

    fn test_manager() -> StoreHandlerManager {
        let mut manager = StoreHandlerManager::new();
        manager
            .register_store_handler(
                HandlerType::Memory,
                json!({ "namespace": Uuid::new_v4().to_string() }),
                &[ModelKind::Host, ModelKind::Cluster],
            )
            .unwrap();
        manager
    }

    fn set(addresses: &[&str]) -> BTreeSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    fn save_host(manager: &mut StoreHandlerManager, address: &str, status: HostStatus) {
        let mut host = Host::new(address);
        host.set_status(status);
        manager.save(host).unwrap();
    }

    #[test]
    fn create_cluster_is_idempotent() {
        let mut manager = test_manager();
        create_cluster(&mut manager, "web").unwrap();
        add_host(&mut manager, "web", "10.0.0.2").unwrap();

        // Une recréation ne doit pas vider le hostset.
        let again = create_cluster(&mut manager, "web").unwrap();
        assert_eq!(again.hostset(), set(&["10.0.0.2"]));
    }

    #[test]
    fn replace_hostset_succeeds_when_old_matches() {
        let mut manager = test_manager();
        let mut cluster = Cluster::new("web");
        cluster.set_status("ok");
        cluster.set_hostset(&set(&["10.0.0.2", "10.0.0.3"]));
        manager.save(cluster).unwrap();

        let updated = replace_hostset(
            &mut manager,
            "web",
            &set(&["10.0.0.2", "10.0.0.3"]),
            &set(&["10.0.0.2", "10.0.0.4"]),
        )
        .unwrap();
        assert_eq!(updated.hostset(), set(&["10.0.0.2", "10.0.0.4"]));

        let stored = manager.get(Cluster::new("web")).unwrap();
        assert_eq!(stored.hostset(), set(&["10.0.0.2", "10.0.0.4"]));
    }

    #[test]
    fn replace_hostset_with_stale_old_conflicts_and_leaves_state() {
        let mut manager = test_manager();
        let mut cluster = Cluster::new("web");
        cluster.set_hostset(&set(&["10.0.0.2", "10.0.0.3"]));
        manager.save(cluster).unwrap();

        let err = replace_hostset(
            &mut manager,
            "web",
            &set(&["10.0.0.2"]),
            &set(&["10.0.0.4"]),
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));

        let stored = manager.get(Cluster::new("web")).unwrap();
        assert_eq!(stored.hostset(), set(&["10.0.0.2", "10.0.0.3"]));
    }

    #[test]
    fn replace_hostset_on_missing_cluster_is_not_found() {
        let mut manager = test_manager();
        let err = replace_hostset(&mut manager, "ghost", &set(&[]), &set(&["10.0.0.2"]))
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[test]
    fn derived_counts_cross_reference_host_statuses() {
        let mut manager = test_manager();
        save_host(&mut manager, "10.0.0.2", HostStatus::Active);
        save_host(&mut manager, "10.0.0.3", HostStatus::Failed);
        save_host(&mut manager, "10.0.0.9", HostStatus::Active); // hors cluster

        let mut cluster = Cluster::new("web");
        cluster.set_hostset(&set(&["10.0.0.2", "10.0.0.3"]));
        manager.save(cluster).unwrap();

        let cluster = retrieve_cluster(&mut manager, "web").unwrap();
        assert_eq!(cluster.hosts.total, 2);
        assert_eq!(cluster.hosts.available, 1);
        assert_eq!(cluster.hosts.unavailable, 1);
    }

    #[test]
    fn add_and_remove_host_are_idempotent() {
        let mut manager = test_manager();
        create_cluster(&mut manager, "web").unwrap();

        add_host(&mut manager, "web", "10.0.0.2").unwrap();
        add_host(&mut manager, "web", "10.0.0.2").unwrap();
        let cluster = manager.get(Cluster::new("web")).unwrap();
        assert_eq!(cluster.hostset(), set(&["10.0.0.2"]));

        remove_host(&mut manager, "web", "10.0.0.2").unwrap();
        remove_host(&mut manager, "web", "10.0.0.2").unwrap();
        let cluster = manager.get(Cluster::new("web")).unwrap();
        assert!(cluster.hostset().is_empty());

        assert!(matches!(
            add_host(&mut manager, "ghost", "10.0.0.2").unwrap_err(),
            ClusterError::NotFound(_)
        ));
    }
}
