//! Privilege elevation for placing files and talking to the system
//! service manager.
//!
//! Elevation is only used when the process is not root and the target
//! directory is not writable. Credentials are validated once per process
//! (`sudo -v`, or a no-op `su root -c true`) before the first elevated
//! command.

use crate::error::{Result, SiteUnitError};
use crate::runner::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::path::Path;
use strum::{Display, EnumIter, EnumString};

/// How elevated commands are run
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    /// Fail instead of elevating
    Never,
    #[default]
    Sudo,
    Su,
}

/// Elevation chosen for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    NotNeeded,
    Sudo,
    Su,
}

impl Elevation {
    pub fn is_elevated(self) -> bool {
        self != Elevation::NotNeeded
    }

    /// Wrap `command` so it runs with this elevation.
    pub fn wrap(self, command: CommandSpec) -> CommandSpec {
        match self {
            Elevation::NotNeeded => command,
            Elevation::Sudo => CommandSpec::new("sudo")
                .arg(command.program)
                .args(command.args)
                .interactive(),
            Elevation::Su => CommandSpec::new("su")
                .args(["root", "-c"])
                .arg(command.to_string())
                .interactive(),
        }
    }
}

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Whether files can be created in `dir`, judged on its nearest existing
/// ancestor when `dir` does not exist yet.
pub fn dir_writable(dir: &Path) -> bool {
    let existing = dir.ancestors().find(|p| p.exists());
    existing.is_some_and(|p| nix::unistd::access(p, nix::unistd::AccessFlags::W_OK).is_ok())
}

pub fn needs_elevation(is_root: bool, dir_writable: bool) -> bool {
    !is_root && !dir_writable
}

/// Pick the elevation for a directory; no commands are run.
pub fn decide(mode: PrivilegeMode, is_root: bool, dir_writable: bool, dir: &Path) -> Result<Elevation> {
    if !needs_elevation(is_root, dir_writable) {
        return Ok(Elevation::NotNeeded);
    }
    match mode {
        PrivilegeMode::Never => Err(SiteUnitError::privilege(format!(
            "{} is not writable and elevation is disabled (--privilege never)",
            dir.display()
        ))),
        PrivilegeMode::Sudo => Ok(Elevation::Sudo),
        PrivilegeMode::Su => Ok(Elevation::Su),
    }
}

/// Elevation decisions and credential validation for one process
pub struct Privilege<'r> {
    mode: PrivilegeMode,
    runner: &'r dyn CommandRunner,
    validated: Cell<bool>,
}

impl<'r> Privilege<'r> {
    pub fn new(mode: PrivilegeMode, runner: &'r dyn CommandRunner) -> Self {
        Self {
            mode,
            runner,
            validated: Cell::new(false),
        }
    }

    pub fn mode(&self) -> PrivilegeMode {
        self.mode
    }

    /// Elevation needed to write into `dir`, validating credentials the
    /// first time elevation is needed.
    pub fn acquire(&self, dir: &Path) -> Result<Elevation> {
        let elevation = decide(self.mode, is_root(), dir_writable(dir), dir)?;
        if elevation.is_elevated() && !self.validated.get() {
            self.validate(elevation)?;
            self.validated.set(true);
        }
        Ok(elevation)
    }

    fn validate(&self, elevation: Elevation) -> Result<()> {
        let check = match elevation {
            Elevation::Sudo => CommandSpec::new("sudo").arg("-v").interactive(),
            Elevation::Su => Elevation::Su.wrap(CommandSpec::new("true")),
            Elevation::NotNeeded => return Ok(()),
        };
        tracing::info!("Validating credentials with {}", check.program);
        let output = self.runner.run(&check)?;
        if output.success {
            Ok(())
        } else {
            Err(SiteUnitError::privilege(format!(
                "`{}` failed (exit code {})",
                check,
                output.exit_code.unwrap_or(-1)
            )))
        }
    }

    /// Run `command` with `elevation`, failing on a non-zero exit.
    pub fn run(&self, elevation: Elevation, command: CommandSpec) -> Result<()> {
        let command = elevation.wrap(command);
        self.runner.run(&command)?.ensure_success(&command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;
    use std::str::FromStr;

    #[test]
    fn test_mode_names() {
        assert_eq!(PrivilegeMode::from_str("SUDO").unwrap(), PrivilegeMode::Sudo);
        assert_eq!(PrivilegeMode::Never.to_string(), "never");
        assert_eq!(PrivilegeMode::default(), PrivilegeMode::Sudo);
    }

    #[test]
    fn test_elevation_only_when_needed() {
        let dir = Path::new("/etc/nginx/conf.d");
        assert_eq!(decide(PrivilegeMode::Never, true, false, dir).unwrap(), Elevation::NotNeeded);
        assert_eq!(decide(PrivilegeMode::Never, false, true, dir).unwrap(), Elevation::NotNeeded);
        assert_eq!(decide(PrivilegeMode::Su, false, false, dir).unwrap(), Elevation::Su);
        assert!(matches!(
            decide(PrivilegeMode::Never, false, false, dir),
            Err(SiteUnitError::PrivilegeElevation(_))
        ));
    }

    #[test]
    fn test_wrapping() {
        let cmd = CommandSpec::new("systemctl").args(["reload", "nginx"]);
        assert_eq!(Elevation::NotNeeded.wrap(cmd.clone()).to_string(), "systemctl reload nginx");
        assert_eq!(Elevation::Sudo.wrap(cmd.clone()).to_string(), "sudo systemctl reload nginx");
        assert_eq!(Elevation::Su.wrap(cmd).to_string(), "su root -c 'systemctl reload nginx'");
    }

    #[test]
    fn test_writable_dir_needs_no_elevation() {
        let runner = RecordingRunner::new();
        let dir = tempfile::TempDir::new().unwrap();
        let privilege = Privilege::new(PrivilegeMode::Never, &runner);

        let elevation = privilege.acquire(&dir.path().join("not/yet/created")).unwrap();

        assert_eq!(elevation, Elevation::NotNeeded);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_run_reports_failures() {
        let runner = RecordingRunner::new();
        runner.fail_on("systemctl start", 1);
        let privilege = Privilege::new(PrivilegeMode::Sudo, &runner);

        let err = privilege
            .run(Elevation::Sudo, CommandSpec::new("systemctl").args(["start", "shop.service"]))
            .unwrap_err();

        assert!(matches!(err, SiteUnitError::Command { command, .. } if command == "sudo systemctl start shop.service"));
    }
}
