//! Artifact kinds, rendered artifacts and their structural checks.

use crate::context::ParameterContext;
use crate::error::{Result, SiteUnitError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// What kind of file is generated
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// nginx server block
    #[strum(to_string = "proxy-site", serialize = "nginx")]
    ProxySite,
    /// systemd unit running the web application
    #[strum(to_string = "service-unit", serialize = "systemd")]
    ServiceUnit,
    /// systemd unit running the background worker
    #[strum(to_string = "worker-unit", serialize = "celery")]
    WorkerUnit,
    /// supervisord program entry for the background worker
    #[strum(to_string = "supervisor-entry", serialize = "supervisor", serialize = "supervisord")]
    SupervisorEntry,
    /// systemd unit holding an ssh port forward open
    #[strum(to_string = "tunnel-unit", serialize = "tunnel", serialize = "ssh-tunnel")]
    TunnelUnit,
}

impl ArtifactKind {
    /// Parse a kind name or alias.
    pub fn parse(name: &str) -> Result<Self> {
        name.trim()
            .parse()
            .map_err(|_| SiteUnitError::UnknownArtifactKind(name.trim().to_string()))
    }

    /// Parse a comma-separated list, dropping repeats.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut kinds = Vec::new();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = Self::parse(name)?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            return Err(SiteUnitError::UnknownArtifactKind(list.to_string()));
        }
        Ok(kinds)
    }

    pub fn template_name(self) -> &'static str {
        match self {
            ArtifactKind::ProxySite => "nginx.conf",
            ArtifactKind::ServiceUnit => "systemd.service",
            ArtifactKind::WorkerUnit => "celery.service",
            ArtifactKind::SupervisorEntry => "supervisor.ini",
            ArtifactKind::TunnelUnit => "secure-tunnel.service",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ArtifactKind::ProxySite => "nginx reverse proxy site",
            ArtifactKind::ServiceUnit => "systemd unit for the web application",
            ArtifactKind::WorkerUnit => "systemd unit for the background worker",
            ArtifactKind::SupervisorEntry => "supervisord entry for the background worker",
            ArtifactKind::TunnelUnit => "systemd unit for an ssh tunnel",
        }
    }

    pub fn is_systemd_unit(self) -> bool {
        matches!(
            self,
            ArtifactKind::ServiceUnit | ArtifactKind::WorkerUnit | ArtifactKind::TunnelUnit
        )
    }

    /// Address an integer HOST is bound to, for kinds that use HOST.
    pub fn host_address(self) -> Option<&'static str> {
        match self {
            ArtifactKind::ProxySite => Some("127.0.0.1"),
            ArtifactKind::ServiceUnit | ArtifactKind::WorkerUnit => Some("0.0.0.0"),
            _ => None,
        }
    }

    /// File name of the artifact for application `stem`
    pub fn file_name(self, stem: &str) -> String {
        match self {
            ArtifactKind::ProxySite => format!("{stem}.conf"),
            ArtifactKind::ServiceUnit => format!("{stem}.service"),
            ArtifactKind::WorkerUnit => format!("{stem}-worker.service"),
            ArtifactKind::SupervisorEntry => format!("{stem}-worker.ini"),
            ArtifactKind::TunnelUnit => format!("{stem}-tunnel.service"),
        }
    }

    /// Application name the artifact is filed under.
    ///
    /// `APPNAME`, falling back to `SERVER_NAME` for proxy sites.
    pub fn stem(self, ctx: &ParameterContext) -> Result<String> {
        if let Some(name) = ctx.get_str("APPNAME")? {
            return Ok(name.to_string());
        }
        if self == ArtifactKind::ProxySite {
            if let Some(name) = ctx.get_str("SERVER_NAME")? {
                return Ok(name.to_string());
            }
        }
        Err(SiteUnitError::MissingRequiredParameter {
            name: "APPNAME".to_string(),
            template: self.template_name().to_string(),
        })
    }

    /// Kinds and their aliases, for help output
    pub fn names() -> Vec<String> {
        Self::iter().map(|k| k.to_string()).collect()
    }
}

/// A rendered file and where it belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub application: String,
    /// Always ends in a newline
    pub text: String,
    pub target_path: PathBuf,
    /// Destined for the per-user systemd instance
    pub user_scope: bool,
}

impl Artifact {
    /// Name the service manager knows the artifact by.
    pub fn service_name(&self) -> String {
        match self.kind {
            ArtifactKind::ProxySite => "nginx".to_string(),
            ArtifactKind::SupervisorEntry => format!("{}-worker", self.application),
            _ => self
                .target_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.kind.file_name(&self.application)),
        }
    }
}

/// Directories artifacts are installed into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDirs {
    pub nginx: PathBuf,
    pub systemd: PathBuf,
    pub user_systemd: PathBuf,
    pub supervisor: PathBuf,
}

impl Default for TargetDirs {
    fn default() -> Self {
        Self {
            nginx: first_existing(&[
                PathBuf::from("/etc/nginx/sites-enabled"),
                PathBuf::from("/etc/nginx/conf.d"),
            ]),
            systemd: PathBuf::from("/etc/systemd/system"),
            user_systemd: paths::expand_user(Path::new("~/.config/systemd/user")),
            supervisor: first_existing(&[
                PathBuf::from("/etc/supervisor/conf.d"),
                PathBuf::from("/etc/supervisord.d"),
            ]),
        }
    }
}

impl TargetDirs {
    /// All artifacts under one directory, as used by tests and dry runs.
    pub fn under(root: &Path) -> Self {
        Self {
            nginx: root.join("nginx"),
            systemd: root.join("systemd"),
            user_systemd: root.join("systemd-user"),
            supervisor: root.join("supervisor"),
        }
    }

    pub fn target_path(&self, kind: ArtifactKind, stem: &str, user_scope: bool) -> PathBuf {
        let dir = match kind {
            ArtifactKind::ProxySite => &self.nginx,
            ArtifactKind::SupervisorEntry => &self.supervisor,
            _ if user_scope => &self.user_systemd,
            _ => &self.systemd,
        };
        dir.join(kind.file_name(stem))
    }
}

/// First candidate that is an existing directory, or the last candidate.
pub fn first_existing(candidates: &[PathBuf]) -> PathBuf {
    candidates
        .iter()
        .find(|p| p.is_dir())
        .or_else(|| candidates.last())
        .cloned()
        .unwrap_or_default()
}

/// Significant lines of a config file, as (first token, whole line).
fn directives(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let first = line.split_whitespace().next()?;
            Some((first.trim_end_matches(';'), line))
        })
}

/// Structural checks on a rendered artifact.
pub fn validate_artifact(kind: ArtifactKind, text: &str, tls: bool) -> Result<()> {
    match kind {
        ArtifactKind::ProxySite => validate_proxy_site(text, tls),
        ArtifactKind::TunnelUnit => validate_tunnel(text),
        _ => Ok(()),
    }
}

fn validate_proxy_site(text: &str, tls: bool) -> Result<()> {
    let kind = ArtifactKind::ProxySite;
    let count = |name: &str| directives(text).filter(|(d, _)| *d == name).count();

    if !tls {
        let listens = count("listen");
        if listens != 1 {
            return Err(SiteUnitError::validation(
                kind,
                format!("expected exactly one listen directive, found {listens}"),
            ));
        }
        return Ok(());
    }

    let ssl_listen = directives(text).any(|(d, line)| {
        d == "listen"
            && line
                .split_whitespace()
                .any(|token| token.trim_end_matches(';') == "ssl")
    });
    if !ssl_listen {
        return Err(SiteUnitError::validation(kind, "TLS is on but no listen directive has ssl"));
    }
    for name in ["ssl_certificate", "ssl_certificate_key"] {
        let found = count(name);
        if found != 1 {
            return Err(SiteUnitError::validation(
                kind,
                format!("expected exactly one {name} directive, found {found}"),
            ));
        }
    }
    Ok(())
}

fn validate_tunnel(text: &str) -> Result<()> {
    let kind = ArtifactKind::TunnelUnit;
    let exec: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("ExecStart="))
        .collect();
    let [exec] = exec.as_slice() else {
        return Err(SiteUnitError::validation(
            kind,
            format!("expected exactly one ExecStart=, found {}", exec.len()),
        ));
    };
    if !exec.split_whitespace().any(|token| token == "-L") {
        return Err(SiteUnitError::validation(kind, "ExecStart= has no -L forward"));
    }

    let restart = text
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("RestartSec="))
        .ok_or_else(|| SiteUnitError::validation(kind, "RestartSec= is missing"))?;
    match restart.trim().parse::<i64>() {
        Ok(secs) if secs > 2 => Ok(()),
        _ => Err(SiteUnitError::validation(
            kind,
            format!("RestartSec={} must be an integer greater than 2", restart.trim()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Layer, Source};

    #[test]
    fn test_kind_names_and_aliases() {
        assert_eq!(ArtifactKind::parse("nginx").unwrap(), ArtifactKind::ProxySite);
        assert_eq!(ArtifactKind::parse("Proxy-Site").unwrap(), ArtifactKind::ProxySite);
        assert_eq!(ArtifactKind::parse("supervisord").unwrap(), ArtifactKind::SupervisorEntry);
        assert_eq!(ArtifactKind::TunnelUnit.to_string(), "tunnel-unit");
        assert!(matches!(
            ArtifactKind::parse("apache"),
            Err(SiteUnitError::UnknownArtifactKind(name)) if name == "apache"
        ));
    }

    #[test]
    fn test_parse_list_dedups_in_order() {
        let kinds = ArtifactKind::parse_list("systemd, nginx,service-unit").unwrap();
        assert_eq!(kinds, vec![ArtifactKind::ServiceUnit, ArtifactKind::ProxySite]);
        assert!(ArtifactKind::parse_list(" , ").is_err());
    }

    #[test]
    fn test_target_paths() {
        let dirs = TargetDirs::under(Path::new("/t"));
        assert_eq!(
            dirs.target_path(ArtifactKind::ProxySite, "shop", false),
            PathBuf::from("/t/nginx/shop.conf")
        );
        assert_eq!(
            dirs.target_path(ArtifactKind::WorkerUnit, "shop", true),
            PathBuf::from("/t/systemd-user/shop-worker.service")
        );
        assert_eq!(
            dirs.target_path(ArtifactKind::SupervisorEntry, "shop", true),
            PathBuf::from("/t/supervisor/shop-worker.ini")
        );
    }

    #[test]
    fn test_stem_falls_back_to_server_name_for_sites() {
        let ctx = ParameterContext::from_layers([
            Layer::new(Source::CommandLine).with("SERVER_NAME", "example.org")
        ]);
        assert_eq!(ArtifactKind::ProxySite.stem(&ctx).unwrap(), "example.org");
        assert!(matches!(
            ArtifactKind::ServiceUnit.stem(&ctx),
            Err(SiteUnitError::MissingRequiredParameter { name, .. }) if name == "APPNAME"
        ));
    }

    // =========================================================================
    // Structural Validation Tests
    // =========================================================================

    #[test]
    fn test_proxy_site_needs_one_listen() {
        let ok = "server {\n    listen 80;\n    # listen 8080;\n}\n";
        assert!(validate_artifact(ArtifactKind::ProxySite, ok, false).is_ok());

        let twice = "server {\n    listen 80;\n    listen 81;\n}\n";
        assert!(matches!(
            validate_artifact(ArtifactKind::ProxySite, twice, false),
            Err(SiteUnitError::ArtifactValidation { .. })
        ));
        assert!(validate_artifact(ArtifactKind::ProxySite, "server {}\n", false).is_err());
    }

    #[test]
    fn test_proxy_site_tls_directives() {
        let ok = "listen 80;\nlisten 443 ssl;\nssl_certificate /a;\nssl_certificate_key /b;\n";
        assert!(validate_artifact(ArtifactKind::ProxySite, ok, true).is_ok());

        let no_ssl = "listen 443;\nssl_certificate /a;\nssl_certificate_key /b;\n";
        assert!(validate_artifact(ArtifactKind::ProxySite, no_ssl, true).is_err());

        let no_key = "listen 443 ssl;\nssl_certificate /a;\n";
        assert!(validate_artifact(ArtifactKind::ProxySite, no_key, true).is_err());
    }

    #[test]
    fn test_tunnel_unit_checks() {
        let ok = "[Service]\nExecStart=/usr/bin/ssh -NT -L 127.0.0.1:5432:localhost:5432 db\nRestartSec=5\n";
        assert!(validate_artifact(ArtifactKind::TunnelUnit, ok, false).is_ok());

        let no_forward = "ExecStart=/usr/bin/ssh -NT db\nRestartSec=5\n";
        assert!(validate_artifact(ArtifactKind::TunnelUnit, no_forward, false).is_err());

        let fast = "ExecStart=/usr/bin/ssh -L 1:h:2 db\nRestartSec=2\n";
        assert!(validate_artifact(ArtifactKind::TunnelUnit, fast, false).is_err());

        let missing = "ExecStart=/usr/bin/ssh -L 1:h:2 db\n";
        assert!(validate_artifact(ArtifactKind::TunnelUnit, missing, false).is_err());
    }

    #[test]
    fn test_other_kinds_have_no_structure_checks() {
        assert!(validate_artifact(ArtifactKind::ServiceUnit, "", false).is_ok());
    }

    #[test]
    fn test_service_names() {
        let artifact = Artifact {
            kind: ArtifactKind::ServiceUnit,
            application: "shop".into(),
            text: "\n".into(),
            target_path: PathBuf::from("/etc/systemd/system/shop.service"),
            user_scope: false,
        };
        assert_eq!(artifact.service_name(), "shop.service");
        let entry = Artifact {
            kind: ArtifactKind::SupervisorEntry,
            ..artifact
        };
        assert_eq!(entry.service_name(), "shop-worker");
    }
}
