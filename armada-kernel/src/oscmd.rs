/**
 * OSCMD - Catalogue de commandes par système d'exploitation
 *
 * RÔLE : abstraction des séquences de commandes qui changent d'un OS à
 * l'autre : redémarrage des services du substrat, montée de version des
 * paquets, déploiement d'une image, installation des dépendances au
 * bootstrap d'un hôte.
 */

#[derive(Debug, thiserror::Error)]
pub enum OsCmdError {
    #[error("no command catalog for OS '{0}'")]
    UnsupportedOs(String),
    #[error("operation '{op}' is not available on OS '{os}'")]
    UnsupportedOperation { op: &'static str, os: &'static str },
}

// Services du substrat de conteneurs gérés sur chaque hôte.
const DOCKER_SERVICE: &str = "docker";
const FLANNEL_SERVICE: &str = "flanneld";
const KUBELET_SERVICE: &str = "kubelet";
const KUBE_PROXY_SERVICE: &str = "kube-proxy";

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn restart_services() -> Vec<Vec<String>> {
    vec![cmd(&[
        "systemctl",
        "restart",
        DOCKER_SERVICE,
        FLANNEL_SERVICE,
        KUBELET_SERVICE,
        KUBE_PROXY_SERVICE,
    ])]
}

/// Séquences de commandes d'un OS donné.
pub trait OsCmd: Send + Sync + std::fmt::Debug {
    fn os(&self) -> &'static str;

    /// Redémarre les services du substrat.
    fn restart(&self) -> Vec<Vec<String>> {
        restart_services()
    }

    /// Monte les paquets à leur dernière version.
    fn upgrade(&self) -> Vec<Vec<String>>;

    /// Déploie une image/version précise. Seuls les OS à image atomique
    /// savent faire.
    fn deploy(&self, version: &str) -> Result<Vec<Vec<String>>, OsCmdError> {
        let _ = version;
        Err(OsCmdError::UnsupportedOperation {
            op: "deploy",
            os: self.os(),
        })
    }

    /// Installe les dépendances requises sur un hôte fraîchement admis.
    fn bootstrap(&self) -> Vec<Vec<String>>;
}

#[derive(Debug)]
struct Fedora;

impl OsCmd for Fedora {
    fn os(&self) -> &'static str {
        "fedora"
    }

    fn upgrade(&self) -> Vec<Vec<String>> {
        vec![cmd(&["dnf", "upgrade", "-y"])]
    }

    fn bootstrap(&self) -> Vec<Vec<String>> {
        vec![
            cmd(&["dnf", "install", "-y", "libselinux-python"]),
            cmd(&["dnf", "install", "-y", "docker"]),
            cmd(&["dnf", "install", "-y", "flannel"]),
            cmd(&["dnf", "install", "-y", "kubernetes-node"]),
        ]
    }
}

#[derive(Debug)]
struct Rhel;

impl OsCmd for Rhel {
    fn os(&self) -> &'static str {
        "rhel"
    }

    fn upgrade(&self) -> Vec<Vec<String>> {
        vec![cmd(&["yum", "update", "-y"])]
    }

    fn bootstrap(&self) -> Vec<Vec<String>> {
        vec![
            cmd(&["yum", "install", "-y", "libselinux-python"]),
            cmd(&["yum", "install", "-y", "docker"]),
            cmd(&["yum", "install", "-y", "flannel"]),
            cmd(&["yum", "install", "-y", "kubernetes-node"]),
        ]
    }
}

#[derive(Debug)]
struct Atomic;

impl OsCmd for Atomic {
    fn os(&self) -> &'static str {
        "atomic"
    }

    fn upgrade(&self) -> Vec<Vec<String>> {
        vec![cmd(&["rpm-ostree", "upgrade"])]
    }

    fn deploy(&self, version: &str) -> Result<Vec<Vec<String>>, OsCmdError> {
        Ok(vec![vec![
            "rpm-ostree".to_string(),
            "deploy".to_string(),
            version.to_string(),
        ]])
    }

    // Tout est déjà dans l'image.
    fn bootstrap(&self) -> Vec<Vec<String>> {
        Vec::new()
    }
}

static FEDORA: Fedora = Fedora;
static RHEL: Rhel = Rhel;
static ATOMIC: Atomic = Atomic;

/// Retourne le catalogue du type d'OS demandé.
pub fn get_oscmd(os: &str) -> Result<&'static dyn OsCmd, OsCmdError> {
    match os {
        "fedora" => Ok(&FEDORA),
        "rhel" | "redhat" => Ok(&RHEL),
        "atomic" => Ok(&ATOMIC),
        other => Err(OsCmdError::UnsupportedOs(other.to_string())),
    }
}
