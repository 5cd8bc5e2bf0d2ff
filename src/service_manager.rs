//! Service manager calls around placing and removing an artifact.
//!
//! Plans are plain command lists so they can be inspected without running
//! anything; [`ServiceManager`] runs them through the privilege layer.

use crate::artifact::ArtifactKind;
use crate::error::Result;
use crate::privilege::{Elevation, Privilege};
use crate::runner::CommandSpec;
use strum::Display;

/// When a plan runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// After placement, before activation; failure undoes the placement
    Check,
    /// After placement
    Activate,
    /// Before the file is removed
    Deactivate,
    /// After the file is removed
    Reload,
}

/// One command of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: CommandSpec,
    /// A failure is logged and the plan continues
    pub tolerant: bool,
}

impl Step {
    fn strict(command: CommandSpec) -> Self {
        Self {
            command,
            tolerant: false,
        }
    }

    fn tolerant(command: CommandSpec) -> Self {
        Self {
            command,
            tolerant: true,
        }
    }
}

fn systemctl(user_scope: bool) -> CommandSpec {
    let cmd = CommandSpec::new("systemctl");
    if user_scope { cmd.arg("--user") } else { cmd }
}

fn supervisorctl(action: &str) -> CommandSpec {
    CommandSpec::new("supervisorctl").arg(action)
}

/// Commands for `phase` of an artifact known to the service manager as
/// `service`.
pub fn plan(phase: Phase, kind: ArtifactKind, service: &str, user_scope: bool) -> Vec<Step> {
    match (kind, phase) {
        (ArtifactKind::ProxySite, Phase::Check) => {
            vec![Step::strict(CommandSpec::new("nginx").arg("-t"))]
        }
        (ArtifactKind::ProxySite, Phase::Activate) => {
            vec![Step::strict(systemctl(false).args(["reload", "nginx"]))]
        }
        (ArtifactKind::ProxySite, Phase::Reload) => {
            vec![Step::tolerant(systemctl(false).args(["reload", "nginx"]))]
        }
        (ArtifactKind::SupervisorEntry, Phase::Activate) => vec![
            Step::strict(supervisorctl("reread")),
            Step::strict(supervisorctl("update")),
        ],
        (ArtifactKind::SupervisorEntry, Phase::Deactivate) => {
            vec![Step::tolerant(supervisorctl("stop").arg(service))]
        }
        (ArtifactKind::SupervisorEntry, Phase::Reload) => vec![
            Step::tolerant(supervisorctl("reread")),
            Step::tolerant(supervisorctl("update")),
        ],
        (kind, Phase::Activate) if kind.is_systemd_unit() => vec![
            Step::strict(systemctl(user_scope).arg("daemon-reload")),
            Step::strict(systemctl(user_scope).args(["enable", service])),
            Step::strict(systemctl(user_scope).args(["start", service])),
        ],
        (kind, Phase::Deactivate) if kind.is_systemd_unit() => vec![
            Step::tolerant(systemctl(user_scope).args(["stop", service])),
            Step::tolerant(systemctl(user_scope).args(["disable", service])),
        ],
        (kind, Phase::Reload) if kind.is_systemd_unit() => {
            vec![Step::tolerant(systemctl(user_scope).arg("daemon-reload"))]
        }
        _ => Vec::new(),
    }
}

/// Runs plans with the elevation chosen for the target.
pub struct ServiceManager<'p> {
    privilege: &'p Privilege<'p>,
}

impl<'p> ServiceManager<'p> {
    pub fn new(privilege: &'p Privilege<'p>) -> Self {
        Self { privilege }
    }

    /// Run the plan for `phase`. The first failing strict step aborts with
    /// its `Command` error.
    ///
    /// User-scope units talk to the invoking user's manager and are never
    /// elevated.
    pub fn run(
        &self,
        phase: Phase,
        kind: ArtifactKind,
        service: &str,
        user_scope: bool,
        elevation: Elevation,
    ) -> Result<()> {
        let elevation = if user_scope && kind.is_systemd_unit() {
            Elevation::NotNeeded
        } else {
            elevation
        };
        for step in plan(phase, kind, service, user_scope) {
            match self.privilege.run(elevation, step.command) {
                Ok(()) => {}
                Err(err) if step.tolerant => {
                    tracing::warn!("Ignoring failed {} step: {}", phase, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SiteUnitError;
    use crate::privilege::PrivilegeMode;
    use crate::runner::RecordingRunner;

    fn lines(steps: &[Step]) -> Vec<String> {
        steps.iter().map(|s| s.command.to_string()).collect()
    }

    #[test]
    fn test_unit_plans() {
        let activate = plan(Phase::Activate, ArtifactKind::ServiceUnit, "shop.service", false);
        assert_eq!(
            lines(&activate),
            vec![
                "systemctl daemon-reload",
                "systemctl enable shop.service",
                "systemctl start shop.service"
            ]
        );
        assert!(activate.iter().all(|s| !s.tolerant));

        let deactivate = plan(Phase::Deactivate, ArtifactKind::TunnelUnit, "db-tunnel.service", true);
        assert_eq!(
            lines(&deactivate),
            vec![
                "systemctl --user stop db-tunnel.service",
                "systemctl --user disable db-tunnel.service"
            ]
        );
        assert!(deactivate.iter().all(|s| s.tolerant));
        assert!(plan(Phase::Check, ArtifactKind::WorkerUnit, "w", false).is_empty());
    }

    #[test]
    fn test_proxy_site_plans() {
        assert_eq!(lines(&plan(Phase::Check, ArtifactKind::ProxySite, "nginx", false)), vec!["nginx -t"]);
        assert_eq!(
            lines(&plan(Phase::Activate, ArtifactKind::ProxySite, "nginx", false)),
            vec!["systemctl reload nginx"]
        );
        assert!(plan(Phase::Deactivate, ArtifactKind::ProxySite, "nginx", false).is_empty());
    }

    #[test]
    fn test_supervisor_plans() {
        assert_eq!(
            lines(&plan(Phase::Activate, ArtifactKind::SupervisorEntry, "shop-worker", false)),
            vec!["supervisorctl reread", "supervisorctl update"]
        );
        assert_eq!(
            lines(&plan(Phase::Deactivate, ArtifactKind::SupervisorEntry, "shop-worker", false)),
            vec!["supervisorctl stop shop-worker"]
        );
    }

    #[test]
    fn test_tolerant_steps_do_not_abort() {
        let runner = RecordingRunner::new();
        runner.fail_on("stop", 5);
        let privilege = Privilege::new(PrivilegeMode::Never, &runner);
        let manager = ServiceManager::new(&privilege);

        manager
            .run(Phase::Deactivate, ArtifactKind::ServiceUnit, "shop.service", false, Elevation::NotNeeded)
            .unwrap();

        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_strict_failure_aborts() {
        let runner = RecordingRunner::new();
        runner.fail_on("enable", 1);
        let privilege = Privilege::new(PrivilegeMode::Sudo, &runner);
        let manager = ServiceManager::new(&privilege);

        let err = manager
            .run(Phase::Activate, ArtifactKind::WorkerUnit, "shop-worker.service", false, Elevation::Sudo)
            .unwrap_err();

        assert!(matches!(err, SiteUnitError::Command { .. }));
        assert_eq!(
            runner.calls(),
            vec!["sudo systemctl daemon-reload", "sudo systemctl enable shop-worker.service"]
        );
    }

    #[test]
    fn test_user_units_are_never_elevated() {
        let runner = RecordingRunner::new();
        let privilege = Privilege::new(PrivilegeMode::Sudo, &runner);
        let manager = ServiceManager::new(&privilege);

        manager
            .run(Phase::Reload, ArtifactKind::ServiceUnit, "shop.service", true, Elevation::Sudo)
            .unwrap();

        assert_eq!(runner.calls(), vec!["systemctl --user daemon-reload"]);
    }
}
