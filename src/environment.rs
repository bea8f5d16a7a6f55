//! Shared test environment: acquired once before any suite runs and
//! released once after the last one.
//!
//! The environment consists of two kinds of fixtures:
//!
//! - **Snapshots**: files copied into a backup directory on acquire and
//!   written back on release, so suites are free to mutate them. A file
//!   that did not exist at acquire time is removed again on release.
//! - **Network**: an isolated Docker network, created through a
//!   [`NetworkProvisioner`]. A network that already existed is reused and
//!   left in place on release.
//!
//! Acquisition is all-or-nothing: if any step fails, everything done so far
//! is undone and an [`EnvironmentError`] is returned. Release is best-effort:
//! every step is attempted and failures come back as [`ReleaseWarning`]s.
//!
//! [`EnvironmentGuard`] is the scoped handle for an acquired environment.
//! Dropping it without calling [`EnvironmentGuard::release`] still restores
//! the snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::network::CreateNetworkOptions;
use tracing::{debug, error, info, warn};

use crate::config::EnvironmentConfig;

/// Result type for environment operations.
pub type EnvironmentResult<T> = Result<T, EnvironmentError>;

/// Errors that make environment acquisition fail.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("Failed to create backup directory {}: {source}", path.display())]
    BackupDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to snapshot {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Docker connection error: {0}")]
    Connection(String),

    #[error("Failed to provision network '{name}': {message}")]
    Network { name: String, message: String },
}

/// A release step that did not complete. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseWarning {
    #[error("Failed to restore {}: {message}", path.display())]
    Restore { path: PathBuf, message: String },

    #[error("Failed to remove network '{name}': {message}")]
    Network { name: String, message: String },

    #[error("Failed to clean up {}: {message}", path.display())]
    Cleanup { path: PathBuf, message: String },
}

/// Creates and removes the run's isolated network.
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    /// Creates the network named `name`.
    ///
    /// Returns `Ok(false)` when a network of that name already exists; the
    /// caller then reuses it without taking ownership.
    async fn create(&self, name: &str) -> EnvironmentResult<bool>;

    /// Removes the network named `name`.
    async fn remove(&self, name: &str) -> EnvironmentResult<()>;
}

/// [`NetworkProvisioner`] backed by the Docker daemon.
pub struct DockerNetworks {
    docker: Docker,
    driver: String,
}

impl DockerNetworks {
    /// Connects to `docker_host`, or to the local daemon when unset.
    pub fn connect(docker_host: Option<&str>, driver: &str) -> EnvironmentResult<Self> {
        let docker = if let Some(host) = docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| EnvironmentError::Connection(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| EnvironmentError::Connection(e.to_string()))?
        };

        Ok(Self {
            docker,
            driver: driver.to_string(),
        })
    }
}

#[async_trait]
impl NetworkProvisioner for DockerNetworks {
    async fn create(&self, name: &str) -> EnvironmentResult<bool> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: self.driver.clone(),
            labels: HashMap::from([("convoy.managed".to_string(), "true".to_string())]),
            ..Default::default()
        };

        match self.docker.create_network(options).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(false),
            Err(e) => Err(EnvironmentError::Network {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn remove(&self, name: &str) -> EnvironmentResult<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| EnvironmentError::Network {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

/// One snapshotted file.
#[derive(Debug, Clone)]
struct Snapshot {
    original: PathBuf,
    /// Copy in the backup directory; `None` when the file was absent.
    backup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct ProvisionedNetwork {
    name: String,
    /// False when the network pre-existed and must be left alone.
    owned: bool,
}

/// Acquires the shared environment for a run.
pub struct EnvironmentController {
    config: EnvironmentConfig,
    cleanup: bool,
    provisioner: Option<Arc<dyn NetworkProvisioner>>,
}

impl EnvironmentController {
    /// Creates a controller. With `cleanup` set, the backup copies are
    /// deleted after a successful restore.
    pub fn new(config: EnvironmentConfig, cleanup: bool) -> Self {
        Self {
            config,
            cleanup,
            provisioner: None,
        }
    }

    /// Uses `provisioner` instead of connecting to Docker.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn NetworkProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Snapshots the configured files and provisions the network.
    ///
    /// On failure every completed step is rolled back before returning.
    pub async fn acquire(&self) -> EnvironmentResult<EnvironmentGuard> {
        let backup_dir = self.config.backup_dir.clone();
        if !self.config.snapshot.is_empty() {
            tokio::fs::create_dir_all(&backup_dir)
                .await
                .map_err(|source| EnvironmentError::BackupDir {
                    path: backup_dir.clone(),
                    source,
                })?;
        }

        let mut guard = EnvironmentGuard {
            snapshots: Vec::new(),
            backup_dir: backup_dir.clone(),
            network: None,
            provisioner: None,
            cleanup: self.cleanup,
            released: false,
        };

        for (index, path) in self.config.snapshot.iter().enumerate() {
            match snapshot_file(path, &backup_dir, index).await {
                Ok(snapshot) => guard.snapshots.push(snapshot),
                Err(e) => {
                    error!("{}", e);
                    guard.rollback();
                    return Err(e);
                }
            }
        }

        if let Some(name) = &self.config.network {
            let provisioner = match self.provisioner() {
                Ok(p) => p,
                Err(e) => {
                    guard.rollback();
                    return Err(e);
                }
            };

            match provisioner.create(name).await {
                Ok(owned) => {
                    if owned {
                        info!("Created network {}", name);
                    } else {
                        info!("Network {} already exists, reusing it", name);
                    }
                    guard.network = Some(ProvisionedNetwork {
                        name: name.clone(),
                        owned,
                    });
                    guard.provisioner = Some(provisioner);
                }
                Err(e) => {
                    error!("{}", e);
                    guard.rollback();
                    return Err(e);
                }
            }
        }

        info!(
            "Environment acquired ({} snapshot(s), network: {})",
            guard.snapshots.len(),
            guard.network_name().unwrap_or("none")
        );
        Ok(guard)
    }

    fn provisioner(&self) -> EnvironmentResult<Arc<dyn NetworkProvisioner>> {
        if let Some(provisioner) = &self.provisioner {
            return Ok(provisioner.clone());
        }
        let docker = DockerNetworks::connect(
            self.config.docker_host.as_deref(),
            &self.config.network_driver,
        )?;
        Ok(Arc::new(docker))
    }
}

async fn snapshot_file(
    path: &Path,
    backup_dir: &Path,
    index: usize,
) -> EnvironmentResult<Snapshot> {
    let snapshot_err = |source: std::io::Error| EnvironmentError::Snapshot {
        path: path.to_path_buf(),
        source,
    };

    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "snapshot".to_string());
            // Index prefix keeps same-named files from different dirs apart.
            let backup = backup_dir.join(format!("{:03}-{}", index, file_name));
            tokio::fs::copy(path, &backup).await.map_err(snapshot_err)?;
            debug!("Snapshotted {} to {}", path.display(), backup.display());
            Ok(Snapshot {
                original: path.to_path_buf(),
                backup: Some(backup),
            })
        }
        Ok(_) => Err(snapshot_err(std::io::Error::other("not a regular file"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist yet, will remove it on release", path.display());
            Ok(Snapshot {
                original: path.to_path_buf(),
                backup: None,
            })
        }
        Err(e) => Err(snapshot_err(e)),
    }
}

/// Handle for an acquired environment.
pub struct EnvironmentGuard {
    snapshots: Vec<Snapshot>,
    backup_dir: PathBuf,
    network: Option<ProvisionedNetwork>,
    provisioner: Option<Arc<dyn NetworkProvisioner>>,
    cleanup: bool,
    released: bool,
}

impl EnvironmentGuard {
    pub fn network_name(&self) -> Option<&str> {
        self.network.as_ref().map(|n| n.name.as_str())
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Environment variables exposing the environment to suites.
    pub fn suite_env(&self) -> Vec<(String, String)> {
        let mut env = vec![(
            "CONVOY_BACKUP_DIR".to_string(),
            self.backup_dir.to_string_lossy().to_string(),
        )];
        if let Some(name) = self.network_name() {
            env.push(("CONVOY_NETWORK".to_string(), name.to_string()));
        }
        env
    }

    /// Restores snapshots, removes an owned network and cleans up backups.
    ///
    /// Every step is attempted; failures are logged and returned.
    pub async fn release(mut self) -> Vec<ReleaseWarning> {
        let mut warnings = self.restore_snapshots();

        if let (Some(network), Some(provisioner)) = (&self.network, &self.provisioner) {
            if network.owned {
                match provisioner.remove(&network.name).await {
                    Ok(()) => info!("Removed network {}", network.name),
                    Err(e) => warnings.push(ReleaseWarning::Network {
                        name: network.name.clone(),
                        message: e.to_string(),
                    }),
                }
            } else {
                debug!("Leaving pre-existing network {} in place", network.name);
            }
        }

        if self.cleanup && warnings.is_empty() {
            warnings.extend(self.remove_backups());
        }

        self.released = true;

        for warning in &warnings {
            warn!("{}", warning);
        }
        if warnings.is_empty() {
            info!("Environment released");
        }
        warnings
    }

    fn restore_snapshots(&self) -> Vec<ReleaseWarning> {
        let mut warnings = Vec::new();

        for snapshot in &self.snapshots {
            let outcome = match &snapshot.backup {
                Some(backup) => restore_file(backup, &snapshot.original),
                None => match std::fs::remove_file(&snapshot.original) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
            };

            if let Err(e) = outcome {
                warnings.push(ReleaseWarning::Restore {
                    path: snapshot.original.clone(),
                    message: e.to_string(),
                });
            }
        }

        warnings
    }

    fn remove_backups(&self) -> Vec<ReleaseWarning> {
        let mut warnings = Vec::new();

        for backup in self.snapshots.iter().filter_map(|s| s.backup.as_ref()) {
            if let Err(e) = std::fs::remove_file(backup) {
                warnings.push(ReleaseWarning::Cleanup {
                    path: backup.clone(),
                    message: e.to_string(),
                });
            }
        }

        // Only removes the directory when nothing else lives in it.
        if self.backup_dir.is_dir() && std::fs::remove_dir(&self.backup_dir).is_err() {
            debug!(
                "Backup directory {} not empty, leaving it",
                self.backup_dir.display()
            );
        }

        warnings
    }

    /// Undoes a partial acquisition.
    fn rollback(&mut self) {
        for snapshot in self.snapshots.iter().filter_map(|s| s.backup.as_ref()) {
            let _ = std::fs::remove_file(snapshot);
        }
        let _ = std::fs::remove_dir(&self.backup_dir);
        self.released = true;
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!("Environment dropped without release, restoring snapshots");
        for warning in self.restore_snapshots() {
            warn!("{}", warning);
        }
        if let Some(network) = &self.network
            && network.owned
        {
            warn!("Network {} was not removed", network.name);
        }
    }
}

fn restore_file(backup: &Path, original: &Path) -> std::io::Result<()> {
    if let Some(parent) = original.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(backup, original)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records calls instead of talking to Docker.
    #[derive(Default)]
    struct FakeNetworks {
        existing: bool,
        fail_create: bool,
        fail_remove: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NetworkProvisioner for FakeNetworks {
        async fn create(&self, name: &str) -> EnvironmentResult<bool> {
            self.calls.lock().unwrap().push(format!("create {}", name));
            if self.fail_create {
                return Err(EnvironmentError::Network {
                    name: name.to_string(),
                    message: "daemon unavailable".to_string(),
                });
            }
            Ok(!self.existing)
        }

        async fn remove(&self, name: &str) -> EnvironmentResult<()> {
            self.calls.lock().unwrap().push(format!("remove {}", name));
            if self.fail_remove {
                return Err(EnvironmentError::Network {
                    name: name.to_string(),
                    message: "in use".to_string(),
                });
            }
            Ok(())
        }
    }

    fn config(
        temp_dir: &TempDir,
        snapshot: Vec<PathBuf>,
        network: Option<&str>,
    ) -> EnvironmentConfig {
        EnvironmentConfig {
            snapshot,
            backup_dir: temp_dir.path().join("backup"),
            network: network.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_restored_after_mutation() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = temp_dir.path().join("settings.yml");
        std::fs::write(&fixture, "mode: original\n").unwrap();

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![fixture.clone()], None), true);
        let guard = controller.acquire().await.unwrap();

        std::fs::write(&fixture, "mode: mutated by suite\n").unwrap();
        let warnings = guard.release().await;

        assert!(warnings.is_empty());
        assert_eq!(std::fs::read_to_string(&fixture).unwrap(), "mode: original\n");
        assert!(!temp_dir.path().join("backup").exists());
    }

    #[tokio::test]
    async fn test_absent_snapshot_is_removed_on_release() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = temp_dir.path().join("generated.lock");

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![fixture.clone()], None), true);
        let guard = controller.acquire().await.unwrap();

        std::fs::write(&fixture, "created during run").unwrap();
        assert!(guard.release().await.is_empty());
        assert!(!fixture.exists());
    }

    #[tokio::test]
    async fn test_no_cleanup_keeps_backups() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = temp_dir.path().join("a.conf");
        std::fs::write(&fixture, "a").unwrap();

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![fixture.clone()], None), false);
        let guard = controller.acquire().await.unwrap();
        guard.release().await;

        assert!(temp_dir.path().join("backup").join("000-a.conf").exists());
    }

    #[tokio::test]
    async fn test_owned_network_created_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeNetworks::default());

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![], Some("convoy-net")), true)
                .with_provisioner(fake.clone());
        let guard = controller.acquire().await.unwrap();

        assert_eq!(guard.network_name(), Some("convoy-net"));
        assert!(
            guard
                .suite_env()
                .contains(&("CONVOY_NETWORK".to_string(), "convoy-net".to_string()))
        );

        assert!(guard.release().await.is_empty());
        assert_eq!(
            *fake.calls.lock().unwrap(),
            vec!["create convoy-net", "remove convoy-net"]
        );
    }

    #[tokio::test]
    async fn test_existing_network_is_reused_and_kept() {
        let temp_dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeNetworks {
            existing: true,
            ..Default::default()
        });

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![], Some("shared")), true)
                .with_provisioner(fake.clone());
        controller.acquire().await.unwrap().release().await;

        assert_eq!(*fake.calls.lock().unwrap(), vec!["create shared"]);
    }

    #[tokio::test]
    async fn test_network_failure_rolls_back_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = temp_dir.path().join("state.json");
        std::fs::write(&fixture, "{}").unwrap();
        let fake = Arc::new(FakeNetworks {
            fail_create: true,
            ..Default::default()
        });

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![fixture.clone()], Some("net")), true)
                .with_provisioner(fake);
        let err = controller.acquire().await.err().unwrap();

        assert!(matches!(err, EnvironmentError::Network { .. }));
        assert!(!temp_dir.path().join("backup").exists());
        assert_eq!(std::fs::read_to_string(&fixture).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_directory_snapshot_fails_acquire() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("fixtures");
        std::fs::create_dir(&dir).unwrap();

        let controller = EnvironmentController::new(config(&temp_dir, vec![dir], None), true);
        let err = controller.acquire().await.err().unwrap();

        assert!(matches!(err, EnvironmentError::Snapshot { .. }));
    }

    #[tokio::test]
    async fn test_release_failure_is_a_warning() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = temp_dir.path().join("kept.txt");
        std::fs::write(&fixture, "original").unwrap();
        let fake = Arc::new(FakeNetworks {
            fail_remove: true,
            ..Default::default()
        });

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![fixture.clone()], Some("net")), true)
                .with_provisioner(fake);
        let guard = controller.acquire().await.unwrap();
        std::fs::write(&fixture, "changed").unwrap();

        let warnings = guard.release().await;

        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], ReleaseWarning::Network { .. }));
        // Restore still happened, backups kept because release was not clean.
        assert_eq!(std::fs::read_to_string(&fixture).unwrap(), "original");
        assert!(temp_dir.path().join("backup").exists());
    }

    #[tokio::test]
    async fn test_drop_without_release_restores() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = temp_dir.path().join("drop.txt");
        std::fs::write(&fixture, "before").unwrap();

        let controller =
            EnvironmentController::new(config(&temp_dir, vec![fixture.clone()], None), true);
        {
            let _guard = controller.acquire().await.unwrap();
            std::fs::write(&fixture, "after").unwrap();
        }

        assert_eq!(std::fs::read_to_string(&fixture).unwrap(), "before");
    }
}
