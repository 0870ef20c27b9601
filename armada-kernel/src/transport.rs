/**
 * TRANSPORT - Exécution distante sur les hôtes de la flotte
 *
 * RÔLE : ouvrir une session SSH vers un hôte avec les credentials stockés
 * (champs cachés du modèle Host), récupérer son profil matériel/logiciel et
 * exécuter des listes de commandes OS.
 *
 * La clé privée est stockée en base64 dans le store; elle est posée dans un
 * fichier temporaire 0600 le temps de la session puis supprimée.
 */

use base64::Engine;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::Host;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unable to reach {address}: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("remote command failed on {address}: {detail}")]
    CommandFailed { address: String, detail: String },
    #[error("malformed probe response from {address}: {detail}")]
    MalformedResponse { address: String, detail: String },
    #[error("invalid credential material for {address}: {detail}")]
    BadCredential { address: String, detail: String },
}

/// Profil matériel/logiciel remonté par un probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfile {
    pub os: String,
    pub cpus: i64,
    pub memory: i64,
    pub space: i64,
}

/// Adresse + credentials nécessaires pour ouvrir une session.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub address: String,
    pub user: String,
    pub key_b64: String,
}

impl RemoteHost {
    /// Extrait les credentials des champs cachés d'un Host.
    pub fn from_host(host: &Host) -> Result<Self, TransportError> {
        let address = host.address();
        let user = host.remote_user().ok_or_else(|| TransportError::BadCredential {
            address: address.clone(),
            detail: "remote_user is not set".into(),
        })?;
        let key = host.ssh_priv_key().ok_or_else(|| TransportError::BadCredential {
            address: address.clone(),
            detail: "ssh_priv_key is not set".into(),
        })?;
        Ok(Self {
            address: address.clone(),
            user: user.to_string(),
            key_b64: key.to_string(),
        })
    }
}

/// Fichier de clé temporaire, supprimé au drop.
struct TemporaryKeyFile {
    path: PathBuf,
}

impl TemporaryKeyFile {
    fn write(host: &RemoteHost) -> Result<Self, TransportError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(host.key_b64.trim())
            .map_err(|e| TransportError::BadCredential {
                address: host.address.clone(),
                detail: format!("ssh key is not valid base64: {e}"),
            })?;
        let path = std::env::temp_dir().join(format!("armada-key-{}", Uuid::new_v4()));
        std::fs::write(&path, decoded).map_err(|e| TransportError::BadCredential {
            address: host.address.clone(),
            detail: format!("unable to write key file: {e}"),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        debug!(path = %path.display(), address = %host.address, "temporary key written");
        Ok(Self { path })
    }
}

impl Drop for TemporaryKeyFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "unable to remove temporary key file: {e}");
        }
    }
}

/// Script de probe : une ligne clé=valeur par information attendue.
const PROBE_COMMAND: &str = concat!(
    ". /etc/os-release 2>/dev/null; echo \"os=${ID:-unknown}\"; ",
    "echo \"cpus=$(nproc)\"; ",
    "echo \"memory=$(awk '/MemTotal/ {print $2 * 1024}' /proc/meminfo)\"; ",
    "echo \"space=$(df -B1 --output=avail / | tail -n 1)\"",
);

/// Parse la sortie du probe en profil structuré.
fn parse_profile(address: &str, output: &str) -> Result<HostProfile, TransportError> {
    let mut os = None;
    let mut cpus = None;
    let mut memory = None;
    let mut space = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "os" => os = Some(value.to_string()),
            "cpus" => cpus = value.parse::<i64>().ok(),
            "memory" => memory = value.parse::<i64>().ok(),
            "space" => space = value.parse::<i64>().ok(),
            _ => {}
        }
    }

    match (os, cpus, memory, space) {
        (Some(os), Some(cpus), Some(memory), Some(space)) => Ok(HostProfile {
            os,
            cpus,
            memory,
            space,
        }),
        _ => Err(TransportError::MalformedResponse {
            address: address.to_string(),
            detail: format!("incomplete probe output: {output:?}"),
        }),
    }
}

/// Interface d'exécution distante. Le worker d'investigation et le worker
/// d'opérations cluster ne connaissent que ce trait.
pub trait Transport: Send + Sync {
    /// Récupère le profil matériel/logiciel de l'hôte.
    fn probe(&self, host: &RemoteHost) -> Result<HostProfile, TransportError>;

    /// Exécute des listes de commandes, dans l'ordre, en s'arrêtant à la
    /// première qui échoue.
    fn run(&self, host: &RemoteHost, commands: &[Vec<String>]) -> Result<(), TransportError>;
}

/// Transport de production : shelle vers le client ssh du système.
pub struct SshTransport {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            command_timeout_secs: 300,
        }
    }
}

impl SshTransport {
    pub fn new(connect_timeout_secs: u64, command_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
            command_timeout_secs,
        }
    }

    fn ssh_args(&self, host: &RemoteHost, key_path: &str, remote: &str) -> Vec<String> {
        // ServerAliveInterval borne les sessions mortes : le client coupe
        // après command_timeout_secs sans réponse du serveur.
        let alive_count = (self.command_timeout_secs / 15).max(1);
        vec![
            "-i".into(),
            key_path.into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".into(),
            "ServerAliveInterval=15".into(),
            "-o".into(),
            format!("ServerAliveCountMax={alive_count}"),
            format!("{}@{}", host.user, host.address),
            remote.to_string(),
        ]
    }

    fn ssh_exec(&self, host: &RemoteHost, remote: &str) -> Result<String, TransportError> {
        let key = TemporaryKeyFile::write(host)?;
        let output = Command::new("ssh")
            .args(self.ssh_args(host, &key.path.display().to_string(), remote))
            .output()
            .map_err(|e| TransportError::Unreachable {
                address: host.address.clone(),
                reason: format!("unable to launch ssh: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TransportError::Unreachable {
                address: host.address.clone(),
                reason: if stderr.is_empty() {
                    format!("ssh exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Transport for SshTransport {
    fn probe(&self, host: &RemoteHost) -> Result<HostProfile, TransportError> {
        debug!(address = %host.address, "probing host");
        let output = self.ssh_exec(host, PROBE_COMMAND)?;
        parse_profile(&host.address, &output)
    }

    fn run(&self, host: &RemoteHost, commands: &[Vec<String>]) -> Result<(), TransportError> {
        for command in commands {
            let remote = shell_words::join(command.iter().map(String::as_str));
            debug!(address = %host.address, command = %remote, "running remote command");
            self.ssh_exec(host, &remote)
                .map_err(|e| TransportError::CommandFailed {
                    address: host.address.clone(),
                    detail: e.to_string(),
                })?;
        }
        Ok(())
    }
}
