//! Settings file handling.
//!
//! Settings are read from `--config` or `$XDG_CONFIG_HOME/siteunit/config.json`
//! (`~/.config/siteunit/config.json` without XDG). Every field has a default,
//! so a missing file, an empty object, and a partial file are all valid.
//! Command-line flags override what is loaded here.

use crate::artifact::{TargetDirs, first_existing};
use crate::context::Source;
use crate::params;
use crate::paths;
use crate::privilege::{self, PrivilegeMode};
use crate::resolver::DEFAULT_ENV_FILE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Effective settings for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Install records, locks and staged files; see [`Settings::state_dir`]
    pub state_dir: Option<PathBuf>,
    /// Directory whose templates replace the built-in ones by name
    pub template_dir: Option<PathBuf>,
    /// Env file name looked up in the application directory
    pub env_file: String,
    /// Candidate nginx site directories, first existing wins
    pub nginx_dirs: Vec<PathBuf>,
    pub systemd_dir: PathBuf,
    pub user_systemd_dir: PathBuf,
    /// Candidate supervisor program directories, first existing wins
    pub supervisor_dirs: Vec<PathBuf>,
    pub privilege: PrivilegeMode,
    /// Parameter defaults, parsed like command-line values
    pub defaults: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: None,
            template_dir: None,
            env_file: DEFAULT_ENV_FILE.to_string(),
            nginx_dirs: vec![
                PathBuf::from("/etc/nginx/sites-enabled"),
                PathBuf::from("/etc/nginx/conf.d"),
            ],
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            user_systemd_dir: PathBuf::from("~/.config/systemd/user"),
            supervisor_dirs: vec![
                PathBuf::from("/etc/supervisor/conf.d"),
                PathBuf::from("/etc/supervisord.d"),
            ],
            privilege: PrivilegeMode::default(),
            defaults: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Settings file used when `--config` is not given.
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| paths::expand_user(Path::new("~/.config")));
        base.join("siteunit").join("config.json")
    }

    /// Save settings to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        if let Some(dir) = path.as_ref().parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create settings directory {:?}", dir))?;
        }
        fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load settings from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path.as_ref()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings JSON in {:?}", path.as_ref()))?;

        Ok(settings)
    }

    /// Load and validate settings.
    ///
    /// An explicitly named file must exist; the default location is
    /// optional and yields [`Settings::default`] when absent.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        let settings = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let path = Self::default_path();
                if path.is_file() {
                    tracing::debug!("Loading settings from {}", path.display());
                    Self::load_from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        for (name, raw) in &self.defaults {
            let canonical = params::canonical(name);
            if !params::is_known(&canonical) {
                anyhow::bail!("Default for unknown parameter '{}'", name);
            }
            params::parse_value(&canonical, raw, Source::Default)
                .with_context(|| format!("Invalid default for '{}'", name))?;
        }

        if self.nginx_dirs.is_empty() {
            anyhow::bail!("nginx_dirs must name at least one directory");
        }
        if self.supervisor_dirs.is_empty() {
            anyhow::bail!("supervisor_dirs must name at least one directory");
        }

        let env_file = self.env_file.trim();
        if env_file.is_empty() || env_file.contains('/') || env_file == "." || env_file == ".." {
            anyhow::bail!("env_file must be a plain file name, got '{}'", self.env_file);
        }

        Ok(())
    }

    /// State directory: configured, else `/var/lib/siteunit` for root and
    /// `~/.local/state/siteunit` for everyone else.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => paths::expand_user(dir),
            None if privilege::is_root() => PathBuf::from("/var/lib/siteunit"),
            None => paths::expand_user(Path::new("~/.local/state/siteunit")),
        }
    }

    pub fn template_dir(&self) -> Option<PathBuf> {
        self.template_dir.as_deref().map(paths::expand_user)
    }

    /// Install directories, picking the first existing candidate of each list.
    pub fn target_dirs(&self) -> TargetDirs {
        let expand = |dirs: &[PathBuf]| dirs.iter().map(|d| paths::expand_user(d)).collect::<Vec<_>>();
        TargetDirs {
            nginx: first_existing(&expand(&self.nginx_dirs)),
            systemd: paths::expand_user(&self.systemd_dir),
            user_systemd: paths::expand_user(&self.user_systemd_dir),
            supervisor: first_existing(&expand(&self.supervisor_dirs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_object_is_all_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.env_file, ".env");
        assert_eq!(settings.privilege, PrivilegeMode::Sudo);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_roundtrip_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut settings = Settings::default();
        settings.privilege = PrivilegeMode::Never;
        settings.defaults.insert("workers".to_string(), "3".to_string());
        settings.state_dir = Some(dir.path().join("state"));

        settings.save_to_file(&path).unwrap();
        let loaded = Settings::load_from_file(&path).unwrap();

        assert_eq!(loaded, settings);
        assert_eq!(loaded.state_dir(), dir.path().join("state"));
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"privilege": "su", "env_file": "production.env"}"#).unwrap();

        let settings = Settings::load_or_default(Some(path.as_path())).unwrap();

        assert_eq!(settings.privilege, PrivilegeMode::Su);
        assert_eq!(settings.env_file, "production.env");
        assert_eq!(settings.systemd_dir, PathBuf::from("/etc/systemd/system"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Settings::load_or_default(Some(Path::new("/nonexistent/siteunit.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load_from_file(&path).is_err());
    }

    #[test]
    fn test_validation_unknown_default() {
        let mut settings = Settings::default();
        settings.defaults.insert("NOT_A_PARAM".to_string(), "1".to_string());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("NOT_A_PARAM"));
    }

    #[test]
    fn test_validation_unparseable_default() {
        let mut settings = Settings::default();
        settings.defaults.insert("WORKERS".to_string(), "many".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_env_file_must_be_a_name() {
        let mut settings = Settings::default();
        settings.env_file = "../secrets.env".to_string();
        assert!(settings.validate().is_err());
        settings.env_file = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_empty_dir_lists() {
        let mut settings = Settings::default();
        settings.nginx_dirs.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_target_dirs_pick_existing_candidate() {
        let dir = TempDir::new().unwrap();
        let conf_d = dir.path().join("conf.d");
        fs::create_dir(&conf_d).unwrap();

        let mut settings = Settings::default();
        settings.nginx_dirs = vec![dir.path().join("sites-enabled"), conf_d.clone()];
        settings.supervisor_dirs = vec![dir.path().join("a"), dir.path().join("b")];

        let dirs = settings.target_dirs();
        assert_eq!(dirs.nginx, conf_d);
        assert_eq!(dirs.supervisor, dir.path().join("b"));
    }
}
