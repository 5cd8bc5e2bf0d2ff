//! Parameter resolution.
//!
//! Builds the [`ParameterContext`] for one invocation from four layers:
//!
//! ```text
//! Default          invoking user, CPU-based worker count, configured defaults
//! Derived          facts computed from the application directory
//! EnvironmentFile  KEY=VALUE lines, unknown keys skipped
//! CommandLine      key=value arguments
//! ```
//!
//! Resolution never fails because a parameter is missing; which parameters
//! are needed depends on the artifact kind and is enforced at render time.
//! It fails only on values that cannot be parsed, unknown command-line
//! names, or an explicitly named environment file that cannot be read.

use crate::context::{Layer, ParameterContext, Source};
use crate::engine::Value;
use crate::error::{Result, SiteUnitError};
use crate::params::{self, STATIC_DIRS, STATIC_FILES};
use crate::paths;
use nix::unistd::{Group, User, getuid};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File looked up in the application directory when no env file is named
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Everything resolution needs from the caller.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Application checkout; the working directory when absent
    pub app_dir: Option<PathBuf>,
    /// Environment file to read; must exist when given
    pub env_file: Option<PathBuf>,
    /// Name of the optional env file inside the application directory
    pub env_file_name: Option<String>,
    /// Configured default parameters (raw strings)
    pub defaults: BTreeMap<String, String>,
    /// `key=value` arguments
    pub overrides: Vec<String>,
    /// `URL=DIR` static mounts
    pub statics: Vec<String>,
    /// Accept command-line names outside the known table
    pub allow_unknown: bool,
}

impl ResolveRequest {
    /// Canonical application directory
    pub fn application_dir(&self) -> PathBuf {
        let dir = self.app_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        std::fs::canonicalize(&dir).unwrap_or_else(|_| paths::clean(&dir))
    }

    fn env_file_path(&self, app_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = &self.env_file {
            return Some(path.clone());
        }
        let name = self.env_file_name.as_deref().unwrap_or(DEFAULT_ENV_FILE);
        let candidate = app_dir.join(name);
        candidate.is_file().then_some(candidate)
    }
}

/// Resolve the full context for `request`.
pub fn resolve(request: &ResolveRequest) -> Result<ParameterContext> {
    let app_dir = request.application_dir();
    debug!("Resolving parameters for {}", app_dir.display());

    let defaults = default_layer(&request.defaults)?;
    let env = match request.env_file_path(&app_dir) {
        Some(path) => read_env_file(&path, &app_dir)?,
        None => Layer::new(Source::EnvironmentFile),
    };
    let cli = override_layer(&request.overrides, request.allow_unknown)?;
    let statics = parse_statics(&request.statics, &app_dir)?;

    let provisional = ParameterContext::from_layers([defaults.clone(), env.clone(), cli.clone()]);
    let derived = derive_layer(&app_dir, &provisional, &statics)?;

    let context = ParameterContext::from_layers([defaults, derived, env, cli]);
    for (name, entry) in context.iter() {
        debug!("  {name} = {} ({})", entry.value, entry.source);
    }
    Ok(context)
}

/// Name of the invoking user, as the login environment reports it.
fn current_username() -> Option<String> {
    ["LOGNAME", "USER"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.is_empty())
        .or_else(|| User::from_uid(getuid()).ok().flatten().map(|u| u.name))
}

/// `2 * cpus + 1`
pub fn default_workers() -> i64 {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    cpus as i64 * 2 + 1
}

/// Built-in defaults plus configured ones (configured win).
pub fn default_layer(configured: &BTreeMap<String, String>) -> Result<Layer> {
    let mut layer = Layer::new(Source::Default);
    if let Some(user) = current_username() {
        layer.insert("USER", user);
    }
    layer.insert("WORKERS", default_workers());
    for (key, raw) in configured {
        layer.insert(key, params::parse_value(key, raw, Source::Default)?);
    }
    Ok(layer)
}

/// Read a `KEY=VALUE` file. Keys outside the known table and empty values
/// are skipped.
///
/// Values are literal: `$` is never expanded, so nginx variables such as
/// `$host` reach the template unchanged. One pair of matching quotes
/// around a value is removed; an unquoted value ends at ` #`.
pub fn read_env_file(path: &Path, app_dir: &Path) -> Result<Layer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SiteUnitError::config(format!("cannot read environment file {}: {e}", path.display()))
    })?;

    let mut layer = Layer::new(Source::EnvironmentFile);
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = env_assignment(line) else {
            warn!("{}:{}: ignoring line without KEY=VALUE", path.display(), number + 1);
            continue;
        };
        let key = params::canonical(key);
        if !params::is_known(&key) {
            debug!("{}: ignoring unknown key {key}", path.display());
            continue;
        }
        if raw.is_empty() {
            debug!("{}: ignoring empty value for {key}", path.display());
            continue;
        }
        let value = params::parse_value_in(&key, raw, Source::EnvironmentFile, Some(app_dir))?;
        layer.insert(&key, value);
    }
    debug!("Read {} parameter(s) from {}", layer.len(), path.display());
    Ok(layer)
}

/// Split a non-comment line into key and literal value.
fn env_assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    match value.find(" #") {
        Some(at) => value[..at].trim_end(),
        None => value,
    }
}

/// Parse `key=value` arguments.
pub fn override_layer(overrides: &[String], allow_unknown: bool) -> Result<Layer> {
    let mut layer = Layer::new(Source::CommandLine);
    for arg in overrides {
        let (key, value) = params::parse_assignment(arg, Source::CommandLine)?;
        if !params::is_known(&key) {
            if !allow_unknown {
                return Err(SiteUnitError::UnknownParameter { name: key });
            }
            warn!("Passing unknown parameter {key} through to templates");
        }
        layer.insert(&key, value);
    }
    Ok(layer)
}

/// Parse `URL=DIR` static mounts; relative directories are inside the
/// application directory.
pub fn parse_statics(statics: &[String], app_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    statics
        .iter()
        .map(|spec| {
            let (url, dir) = spec.split_once('=').ok_or_else(|| SiteUnitError::InvalidParameter {
                name: "STATIC".into(),
                value: spec.clone(),
                source_layer: Source::CommandLine.to_string(),
                reason: "expected URL=DIR".into(),
            })?;
            Ok((url.to_string(), paths::clean(&app_dir.join(dir))))
        })
        .collect()
}

fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn static_mount(url: &str, dir: &Path) -> Value {
    let url = normalize_url(url);
    let mut mount = BTreeMap::new();
    mount.insert("toplevel".to_string(), Value::Bool(url.is_empty()));
    mount.insert("url".to_string(), Value::String(url));
    mount.insert("dir".to_string(), Value::Path(dir.to_path_buf()));
    Value::Mapping(mount)
}

/// Values computed from the application directory and the other layers.
///
/// A key already present in `known` is not derived.
pub fn derive_layer(
    app_dir: &Path,
    known: &ParameterContext,
    statics: &[(String, PathBuf)],
) -> Result<Layer> {
    let mut layer = Layer::new(Source::Derived);
    let mut derive = |name: &str, value: Value| {
        if !known.contains(name) && value.is_defined() {
            layer.insert(name, value);
        }
    };

    let dir = known.get_path("APPLICATION_DIR")?.map_or_else(|| app_dir.to_path_buf(), Path::to_path_buf);
    derive("APPLICATION_DIR", Value::Path(dir.clone()));
    if let Some(name) = dir.file_name() {
        derive("APPNAME", Value::String(name.to_string_lossy().into_owned()));
    }
    derive("SOCKET", Value::Path(dir.join("app.sock")));
    derive("LOG_DIR", Value::Path(dir.join("logs")));
    derive("VENV", Value::Path(paths::normalize(&dir.join("..").join("venv"))));

    if let Some(username) = known.get_str("USER")? {
        match User::from_name(username) {
            Ok(Some(user)) => {
                derive("HOMEDIR", Value::Path(user.dir.clone()));
                if let Ok(Some(group)) = Group::from_gid(user.gid) {
                    derive("GROUP", Value::String(group.name));
                }
            }
            _ => debug!("User {username} not found on this machine"),
        }
    }

    if let Some(celery) = find_celery(&dir) {
        derive("CELERY", Value::String(celery));
    }

    let mut mounts = Vec::new();
    if let Some(root) = known.get_path("ROOT")? {
        let url = match known.get_str("ROOT_PREFIX")? {
            Some(prefix) => prefix,
            None => known.get_str("PREFIX")?.unwrap_or(""),
        };
        mounts.push(static_mount(url, root));
    }
    for (url, dir) in statics {
        mounts.push(static_mount(url, dir));
    }

    let mount_dir = |mount: &Value| mount.attr("dir").and_then(Value::as_path).map(Path::to_path_buf);
    let is_toplevel = |mount: &Value| mount.attr("toplevel") == Some(&Value::Bool(true));

    if let Some(error_page) = mounts
        .iter()
        .find(|m| mount_dir(*m).is_some_and(|d| d.join("404.html").is_file()))
    {
        derive("ERROR_PAGE", error_page.clone());
    }
    let toplevel_dir = mounts.iter().find(|m| is_toplevel(*m)).and_then(mount_dir);
    match &toplevel_dir {
        Some(root) => derive("ROOT_LOCATION_MATCH", Value::String(url_match(root))),
        None => {
            if let Some(favicon) = find_favicon(&dir) {
                derive("FAVICON", Value::Path(favicon));
            }
        }
    }
    derive("STATICDIRS", Value::Sequence(mounts));

    Ok(layer)
}

/// `<package>.celery` for the first `<package>/celery.py` in `dir`.
fn find_celery(dir: &Path) -> Option<String> {
    let mut packages: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("celery.py").is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    packages.sort();
    packages.into_iter().next().map(|pkg| format!("{pkg}.celery"))
}

fn escape_regex(name: &str) -> String {
    name.replace('.', r"\.")
}

/// nginx location regex matching the well-known static directories and
/// files plus every top-level entry of `root`.
pub fn url_match(root: &Path) -> String {
    let mut dirs: BTreeSet<String> = STATIC_DIRS.iter().map(|d| escape_regex(d)).collect();
    let mut files: BTreeSet<String> = STATIC_FILES.iter().map(|f| escape_regex(f)).collect();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "__pycache__" || (name.starts_with('.') && name != ".well-known") {
                continue;
            }
            if entry.path().is_dir() {
                dirs.insert(escape_regex(&name));
            } else {
                files.insert(escape_regex(&name));
            }
        }
    }
    let dirs = dirs.into_iter().collect::<Vec<_>>().join("|");
    let files = files.into_iter().collect::<Vec<_>>().join("|");
    format!("(^/({dirs})/|^/({files})$)")
}

const FAVICON_DEPTH: usize = 3;

/// First directory (breadth first, shallow) holding a well-known top-level
/// static file such as `favicon.ico`.
fn find_favicon(dir: &Path) -> Option<PathBuf> {
    let mut level = vec![dir.to_path_buf()];
    for _ in 0..FAVICON_DEPTH {
        let mut next = Vec::new();
        for current in &level {
            let Ok(entries) = std::fs::read_dir(current) else {
                continue;
            };
            let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                if path.is_dir() {
                    if !(name.starts_with('.') || name.starts_with('_') || name == "node_modules") {
                        next.push(path);
                    }
                } else if STATIC_FILES.contains(&name.as_str()) {
                    return Some(current.clone());
                }
            }
        }
        level = next;
    }
    None
}
