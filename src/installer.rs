//! Install Manager
//!
//! Places generated artifacts on the system and removes them again.
//!
//! # Design Principles
//!
//! - **Records are ownership**: only files with an install record are ever
//!   replaced or removed without `--force`
//! - **One writer per target**: an advisory `flock` under `<state>/locks/`
//!   guards each target path; a held lock fails fast
//! - **Atomic placement**: the file is written beside the target under a
//!   hidden name and renamed over it
//! - **Roll back what we can**: failures before activation leave neither
//!   file nor record; an activation failure leaves both, marked
//!   `needs-verification`
//!
//! # Install Steps
//!
//! ```text
//! lock -> ownership check -> stage -> elevate -> place -> check -> activate -> record
//! ```

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::{Result, SiteUnitError};
use crate::install_state::{InstallStage, InstallTracker};
use crate::privilege::{Elevation, Privilege, PrivilegeMode};
use crate::record::{InstallRecord, RecordStatus, RecordStore};
use crate::runner::{CommandRunner, CommandSpec};
use crate::service_manager::{Phase, ServiceManager};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Options for [`InstallManager::install`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Replace an installed artifact or an unmanaged file at the target
    pub force: bool,
}

/// Installs and uninstalls artifacts, keeping records under a state
/// directory.
pub struct InstallManager<'r> {
    state_dir: PathBuf,
    records: RecordStore,
    privilege: Privilege<'r>,
}

impl<'r> InstallManager<'r> {
    pub fn new(state_dir: &Path, mode: PrivilegeMode, runner: &'r dyn CommandRunner) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            records: RecordStore::new(state_dir),
            privilege: Privilege::new(mode, runner),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// All install records
    pub fn records(&self) -> Result<Vec<InstallRecord>> {
        self.records.all()
    }

    pub fn record(&self, application: &str, kind: ArtifactKind) -> Result<Option<InstallRecord>> {
        self.records.load(application, kind)
    }

    fn lock(&self, target: &Path) -> Result<Flock<File>> {
        let dir = self.state_dir.join("locks");
        fs::create_dir_all(&dir)?;
        let name: String = target
            .to_string_lossy()
            .trim_start_matches('/')
            .chars()
            .map(|c| if c == '/' { '%' } else { c })
            .collect();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(format!("{name}.lock")))?;

        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| match errno {
            errno if errno == Errno::EWOULDBLOCK => SiteUnitError::Locked {
                target: target.to_path_buf(),
            },
            other => SiteUnitError::Io(other.into()),
        })
    }

    fn staging_path(&self, artifact: &Artifact) -> PathBuf {
        let file_name = artifact
            .target_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(artifact.kind.file_name(&artifact.application)));
        self.state_dir
            .join("staging")
            .join(&artifact.application)
            .join(file_name)
    }

    /// Install `artifact` at its target path.
    pub fn install(&self, artifact: &Artifact, options: InstallOptions) -> Result<InstallRecord> {
        let target = &artifact.target_path;
        let _lock = self.lock(target)?;

        if let Some(existing) = self.records.load(&artifact.application, artifact.kind)? {
            if !options.force {
                return Err(SiteUnitError::AlreadyInstalled {
                    application: artifact.application.clone(),
                    kind: artifact.kind.to_string(),
                    target: existing.target_path,
                });
            }
            tracing::info!(
                "Replacing installed {} for {}",
                artifact.kind,
                artifact.application
            );
            self.remove_installed(&existing)?;
        } else if target.exists() && !options.force {
            return Err(SiteUnitError::UnmanagedTarget {
                target: target.clone(),
            });
        }

        let mut tracker = InstallTracker::new();
        let staged = self.staging_path(artifact);
        if staged.exists() {
            tracing::warn!("Removing stale staged file {}", staged.display());
            fs::remove_file(&staged)?;
        }
        if let Some(dir) = staged.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&staged, &artifact.text)?;
        tracker.advance()?;

        let elevation = match self.place_and_check(artifact, &staged) {
            Ok(elevation) => elevation,
            Err(err) => {
                discard_staged(&staged);
                tracker.roll_back()?;
                return Err(err);
            }
        };

        let services = ServiceManager::new(&self.privilege);
        let service = artifact.service_name();
        let activated = services.run(
            Phase::Activate,
            artifact.kind,
            &service,
            artifact.user_scope,
            elevation,
        );

        let status = if activated.is_ok() {
            RecordStatus::Installed
        } else {
            RecordStatus::NeedsVerification
        };
        let record = InstallRecord::new(artifact, elevation.is_elevated(), status);
        self.records.save(&record)?;
        discard_staged(&staged);
        tracker.advance()?;

        match activated {
            Ok(()) => {
                tracing::info!(
                    "Installed {} for {} at {}",
                    artifact.kind,
                    artifact.application,
                    target.display()
                );
                Ok(record)
            }
            Err(SiteUnitError::Command { command, message }) => Err(SiteUnitError::Activation {
                target: target.clone(),
                command,
                message,
            }),
            Err(err) => Err(err),
        }
    }

    /// Steps 5 to 7: elevate, place, check. On failure nothing is left at
    /// the target.
    fn place_and_check(&self, artifact: &Artifact, staged: &Path) -> Result<Elevation> {
        let target = &artifact.target_path;
        let dir = target.parent().unwrap_or_else(|| Path::new("/"));
        let elevation = self.privilege.acquire(dir)?;

        self.place(staged, target, elevation)?;

        let services = ServiceManager::new(&self.privilege);
        let checked = services.run(
            Phase::Check,
            artifact.kind,
            &artifact.service_name(),
            artifact.user_scope,
            elevation,
        );
        if let Err(err) = checked {
            tracing::warn!("Check failed, removing {}", target.display());
            if let Err(cleanup) = self.remove_file(target, elevation) {
                tracing::warn!("Could not remove {}: {}", target.display(), cleanup);
            }
            return Err(match err {
                SiteUnitError::Command { command, message } => SiteUnitError::Activation {
                    target: target.clone(),
                    command,
                    message,
                },
                other => other,
            });
        }
        Ok(elevation)
    }

    fn place(&self, staged: &Path, target: &Path, elevation: Elevation) -> Result<()> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = target.parent().unwrap_or_else(|| Path::new("/"));
        let tmp = dir.join(format!(".{name}.siteunit-tmp"));

        let placed = if elevation.is_elevated() {
            self.privilege
                .run(
                    elevation,
                    CommandSpec::new("install").args(["-D", "-m", "0644"]).args([
                        staged.to_string_lossy().into_owned(),
                        tmp.to_string_lossy().into_owned(),
                    ]),
                )
                .and_then(|()| {
                    self.privilege.run(
                        elevation,
                        CommandSpec::new("mv").arg("-f").args([
                            tmp.to_string_lossy().into_owned(),
                            target.to_string_lossy().into_owned(),
                        ]),
                    )
                })
        } else {
            place_unprivileged(staged, &tmp, target)
        };

        if placed.is_err() {
            if let Err(err) = self.remove_file(&tmp, elevation) {
                tracing::warn!("Could not remove {}: {}", tmp.display(), err);
            }
        } else {
            tracing::debug!("Placed {}", target.display());
        }
        placed
    }

    fn remove_file(&self, path: &Path, elevation: Elevation) -> Result<()> {
        if elevation.is_elevated() {
            self.privilege.run(
                elevation,
                CommandSpec::new("rm").arg("-f").arg(path.to_string_lossy().into_owned()),
            )
        } else {
            match fs::remove_file(path) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            }
        }
    }

    /// Uninstall the artifact recorded for (`application`, `kind`).
    ///
    /// The record is read once to find the target to lock, then read again
    /// under the lock; only the second read is acted on.
    pub fn uninstall(&self, application: &str, kind: ArtifactKind) -> Result<InstallRecord> {
        let load = || -> Result<InstallRecord> {
            self.records
                .load(application, kind)?
                .ok_or_else(|| SiteUnitError::NotInstalled {
                    application: application.to_string(),
                    kind: kind.to_string(),
                })
        };
        let target = load()?.target_path;
        let _lock = self.lock(&target)?;
        let record = load()?;
        if record.target_path != target {
            // reinstalled elsewhere between the two reads
            return Err(SiteUnitError::Locked {
                target: record.target_path,
            });
        }
        self.remove_installed(&record)?;
        tracing::info!(
            "Uninstalled {} for {} from {}",
            kind,
            application,
            record.target_path.display()
        );
        Ok(record)
    }

    /// Deactivate, remove the file, reload, delete the record. The caller
    /// holds the target lock.
    fn remove_installed(&self, record: &InstallRecord) -> Result<()> {
        let mut tracker = InstallTracker::at(InstallStage::Installed);
        let target = &record.target_path;
        let dir = target.parent().unwrap_or_else(|| Path::new("/"));
        let elevation = self.privilege.acquire(dir)?;
        let services = ServiceManager::new(&self.privilege);

        services.run(Phase::Deactivate, record.kind, &record.service, record.user_scope, elevation)?;
        if target.exists() {
            self.remove_file(target, elevation)?;
        } else {
            tracing::debug!("{} is already gone", target.display());
        }
        services.run(Phase::Reload, record.kind, &record.service, record.user_scope, elevation)?;

        self.records.remove(&record.application, record.kind)?;
        tracker.transition_to(InstallStage::NotInstalled)?;
        Ok(())
    }
}

/// Remove a staged copy that is no longer needed. A leftover is replaced by
/// the next install, so failure only warrants a warning.
fn discard_staged(staged: &Path) {
    if let Err(err) = fs::remove_file(staged) {
        tracing::warn!("Could not remove staged file {}: {}", staged.display(), err);
    }
}

/// Copy `staged` to `tmp`, make it world-readable, rename it over `target`.
fn place_unprivileged(staged: &Path, tmp: &Path, target: &Path) -> Result<()> {
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::copy(staged, tmp)?;
    fs::set_permissions(tmp, fs::Permissions::from_mode(0o644))?;
    fs::rename(tmp, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        state: PathBuf,
        etc: PathBuf,
        runner: RecordingRunner,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let state = root.path().join("state");
        let etc = root.path().join("etc");
        Fixture {
            state,
            etc,
            _root: root,
            runner: RecordingRunner::new(),
        }
    }

    fn unit(fx: &Fixture) -> Artifact {
        Artifact {
            kind: ArtifactKind::ServiceUnit,
            application: "shop".to_string(),
            text: "[Unit]\nDescription=shop website\n".to_string(),
            target_path: fx.etc.join("systemd/shop.service"),
            user_scope: false,
        }
    }

    #[test]
    fn test_install_places_activates_and_records() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);

        let record = manager.install(&artifact, InstallOptions::default()).unwrap();

        assert_eq!(fs::read_to_string(&artifact.target_path).unwrap(), artifact.text);
        let mode = fs::metadata(&artifact.target_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert_eq!(record.status, RecordStatus::Installed);
        assert!(!record.elevated);
        assert_eq!(
            fx.runner.calls(),
            vec![
                "systemctl daemon-reload",
                "systemctl enable shop.service",
                "systemctl start shop.service"
            ]
        );
        assert!(!fx.state.join("staging/shop/shop.service").exists());
        assert_eq!(manager.records().unwrap(), vec![record]);
    }

    #[test]
    fn test_second_install_needs_force() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        manager.install(&artifact, InstallOptions::default()).unwrap();

        assert!(matches!(
            manager.install(&artifact, InstallOptions::default()),
            Err(SiteUnitError::AlreadyInstalled { .. })
        ));

        let mut changed = artifact.clone();
        changed.text.push_str("After=network.target\n");
        manager.install(&changed, InstallOptions { force: true }).unwrap();
        assert_eq!(fs::read_to_string(&changed.target_path).unwrap(), changed.text);
    }

    #[test]
    fn test_unmanaged_target_is_refused() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        fs::create_dir_all(artifact.target_path.parent().unwrap()).unwrap();
        fs::write(&artifact.target_path, "hand written\n").unwrap();

        assert!(matches!(
            manager.install(&artifact, InstallOptions::default()),
            Err(SiteUnitError::UnmanagedTarget { .. })
        ));
        assert_eq!(fs::read_to_string(&artifact.target_path).unwrap(), "hand written\n");
        assert!(fx.runner.calls().is_empty());
    }

    #[test]
    fn test_failed_check_rolls_back() {
        let fx = fixture();
        fx.runner.fail_on("nginx -t", 1);
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = Artifact {
            kind: ArtifactKind::ProxySite,
            application: "shop".to_string(),
            text: "server { listen 80; }\n".to_string(),
            target_path: fx.etc.join("nginx/shop.conf"),
            user_scope: false,
        };

        let err = manager.install(&artifact, InstallOptions::default()).unwrap_err();

        assert!(matches!(err, SiteUnitError::Activation { ref command, .. } if command == "nginx -t"));
        assert!(!artifact.target_path.exists());
        assert!(manager.record("shop", ArtifactKind::ProxySite).unwrap().is_none());
        assert!(!fx.state.join("staging/shop/shop.conf").exists());
    }

    #[test]
    fn test_activation_failure_keeps_file_and_flags_record() {
        let fx = fixture();
        fx.runner.fail_on("systemctl start", 1);
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);

        let err = manager.install(&artifact, InstallOptions::default()).unwrap_err();

        assert!(matches!(err, SiteUnitError::Activation { .. }));
        assert!(artifact.target_path.exists());
        let record = manager.record("shop", ArtifactKind::ServiceUnit).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::NeedsVerification);
    }

    #[test]
    fn test_uninstall_round_trip() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        manager.install(&artifact, InstallOptions::default()).unwrap();
        fx.runner.clear();

        manager.uninstall("shop", ArtifactKind::ServiceUnit).unwrap();

        assert!(!artifact.target_path.exists());
        assert!(manager.records().unwrap().is_empty());
        assert_eq!(
            fx.runner.calls(),
            vec![
                "systemctl stop shop.service",
                "systemctl disable shop.service",
                "systemctl daemon-reload"
            ]
        );
        assert!(matches!(
            manager.uninstall("shop", ArtifactKind::ServiceUnit),
            Err(SiteUnitError::NotInstalled { .. })
        ));
    }

    #[test]
    fn test_uninstall_when_file_already_gone() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        manager.install(&artifact, InstallOptions::default()).unwrap();
        fs::remove_file(&artifact.target_path).unwrap();

        manager.uninstall("shop", ArtifactKind::ServiceUnit).unwrap();

        assert!(manager.record("shop", ArtifactKind::ServiceUnit).unwrap().is_none());
    }

    #[test]
    fn test_held_lock_fails_fast() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        let _held = manager.lock(&artifact.target_path).unwrap();

        assert!(matches!(
            manager.install(&artifact, InstallOptions::default()),
            Err(SiteUnitError::Locked { .. })
        ));
    }

    #[test]
    fn test_uninstall_under_held_lock_changes_nothing() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        manager.install(&artifact, InstallOptions::default()).unwrap();
        fx.runner.clear();
        let held = manager.lock(&artifact.target_path).unwrap();

        assert!(matches!(
            manager.uninstall("shop", ArtifactKind::ServiceUnit),
            Err(SiteUnitError::Locked { .. })
        ));
        assert!(artifact.target_path.exists());
        assert!(manager.record("shop", ArtifactKind::ServiceUnit).unwrap().is_some());
        assert!(fx.runner.calls().is_empty());

        drop(held);
        manager.uninstall("shop", ArtifactKind::ServiceUnit).unwrap();
        assert!(!artifact.target_path.exists());
    }

    #[test]
    fn test_discard_staged_tolerates_missing_file() {
        let fx = fixture();
        let staged = fx.state.join("staging/shop/absent.service");
        discard_staged(&staged);
        assert!(!staged.exists());
    }

    #[test]
    fn test_stale_staged_file_is_replaced() {
        let fx = fixture();
        let manager = InstallManager::new(&fx.state, PrivilegeMode::Never, &fx.runner);
        let artifact = unit(&fx);
        let staged = manager.staging_path(&artifact);
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, "stale\n").unwrap();

        manager.install(&artifact, InstallOptions::default()).unwrap();

        assert_eq!(fs::read_to_string(&artifact.target_path).unwrap(), artifact.text);
        assert!(!staged.exists());
    }
}
