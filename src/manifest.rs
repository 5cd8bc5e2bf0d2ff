//! Template parameter contracts
//!
//! Every template ships with a manifest naming the parameters it needs,
//! the defaults it falls back to, and the checks a value must pass before
//! anything is rendered.
//!
//! # Design Principles
//!
//! 1. **Explicit Contracts**: every template declares its parameters
//! 2. **Defaults are expressions**: evaluated by the template engine against
//!    the partially filled context, in declaration order
//! 3. **Fail Fast**: checks run before rendering and name the offending layer
//!
//! # Manifest Format
//!
//! Manifests are JSON files next to the template they describe:
//! ```json
//! {
//!   "template": "systemd.service",
//!   "description": "gunicorn website unit",
//!   "required": [
//!     { "name": "APPLICATION_DIR", "description": "application checkout", "check": "directory" }
//!   ],
//!   "optional": [
//!     { "name": "STOPWAIT", "description": "seconds to wait on stop", "default": "10" },
//!     { "name": "RESTART", "description": "restart delay", "check": { "min_integer": 3 } }
//!   ]
//! }
//! ```

use crate::context::{ParameterContext, Source};
use crate::engine::{self, Engine, RenderError, Value};
use crate::error::SiteUnitError;
use crate::params;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading manifests
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// No manifest for the template
    #[error("Manifest not found for template: {template}")]
    NotFound { template: String },

    /// Invalid manifest format
    #[error("Invalid manifest format: {reason}")]
    InvalidFormat { reason: String },

    /// IO error reading manifest
    #[error("Failed to read manifest: {reason}")]
    IoError { reason: String },
}

impl From<std::io::Error> for ManifestError {
    fn from(err: std::io::Error) -> Self {
        ManifestError::IoError {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::InvalidFormat {
            reason: err.to_string(),
        }
    }
}

impl From<ManifestError> for SiteUnitError {
    fn from(err: ManifestError) -> Self {
        SiteUnitError::Manifest(err.to_string())
    }
}

/// A precondition on a parameter value, checked against the filesystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamCheck {
    /// Must name an existing directory
    Directory,
    /// Must name an existing regular file
    File,
    /// Must be a directory holding this executable
    ContainsExecutable(String),
    /// Must be an integer no smaller than this
    MinInteger(i64),
}

impl ParamCheck {
    /// Verify `value`, returning the reason on failure.
    pub fn verify(&self, value: &Value) -> Result<(), String> {
        match self {
            ParamCheck::Directory => {
                let path = path_of(value)?;
                if path.is_dir() {
                    Ok(())
                } else {
                    Err(format!("{} is not a directory", path.display()))
                }
            }
            ParamCheck::File => {
                let path = path_of(value)?;
                if path.is_file() {
                    Ok(())
                } else {
                    Err(format!("{} is not a file", path.display()))
                }
            }
            ParamCheck::ContainsExecutable(relative) => {
                let exe = path_of(value)?.join(relative);
                let executable = exe.is_file()
                    && nix::unistd::access(&exe, nix::unistd::AccessFlags::X_OK).is_ok();
                if executable {
                    Ok(())
                } else {
                    Err(format!("{} is not executable", exe.display()))
                }
            }
            ParamCheck::MinInteger(min) => match value {
                Value::Integer(n) if n >= min => Ok(()),
                Value::Integer(_) => Err(format!("must be at least {min}")),
                other => Err(format!("expected an integer, got a {}", other.type_name())),
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            ParamCheck::Directory => "existing directory".to_string(),
            ParamCheck::File => "existing file".to_string(),
            ParamCheck::ContainsExecutable(exe) => format!("must contain {exe}"),
            ParamCheck::MinInteger(min) => format!(">= {min}"),
        }
    }
}

fn path_of(value: &Value) -> Result<&Path, String> {
    match value {
        Value::Path(p) => Ok(p),
        Value::String(s) => Ok(Path::new(s)),
        other => Err(format!("expected a path, got a {}", other.type_name())),
    }
}

/// A parameter a template uses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name (e.g., "SERVER_NAME")
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Default expression, evaluated when the parameter is absent
    #[serde(default)]
    pub default: Option<String>,

    /// Check run before rendering
    #[serde(default)]
    pub check: Option<ParamCheck>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: params::canonical(&name.into()),
            description: description.into(),
            default: None,
            check: None,
        }
    }

    /// Add a default expression
    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    /// Add a check
    pub fn with_check(mut self, check: ParamCheck) -> Self {
        self.check = Some(check);
        self
    }
}

/// Parameter contract of one template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateManifest {
    /// Template name (e.g., "nginx.conf")
    pub template: String,

    /// What the template produces
    pub description: String,

    #[serde(default)]
    pub required: Vec<ParamSpec>,

    #[serde(default)]
    pub optional: Vec<ParamSpec>,
}

impl TemplateManifest {
    pub fn builder(template: impl Into<String>, description: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(template, description)
    }

    /// Load a manifest from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load a manifest from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let mut manifest: Self = serde_json::from_str(json)?;
        for spec in manifest.required.iter_mut().chain(manifest.optional.iter_mut()) {
            spec.name = params::canonical(&spec.name);
        }
        manifest.validate_structure()?;
        Ok(manifest)
    }

    /// Validate the manifest structure itself
    fn validate_structure(&self) -> Result<(), ManifestError> {
        if self.template.trim().is_empty() {
            return Err(ManifestError::InvalidFormat {
                reason: "template name is empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for spec in self.params() {
            if !seen.insert(spec.name.as_str()) {
                return Err(ManifestError::InvalidFormat {
                    reason: format!("Duplicate parameter: {}", spec.name),
                });
            }
            if let Some(expr) = &spec.default {
                engine::validate_expression(&self.origin(&spec.name), expr).map_err(|err| {
                    ManifestError::InvalidFormat {
                        reason: format!("default of {}: {err}", spec.name),
                    }
                })?;
            }
        }

        Ok(())
    }

    fn origin(&self, name: &str) -> String {
        format!("{}:{name}", self.template)
    }

    /// Required parameters first, then optional, in declaration order
    pub fn params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.required.iter().chain(self.optional.iter())
    }

    pub fn is_required(&self, name: &str) -> bool {
        let name = params::canonical(name);
        self.required.iter().any(|spec| spec.name == name)
    }

    /// Fill absent parameters from their default expressions.
    ///
    /// Each default sees the values filled before it. A default that
    /// evaluates to undefined, or refers to an undefined parameter, leaves
    /// its parameter unset.
    pub fn fill_defaults(&self, engine: &Engine, ctx: &mut ParameterContext) -> crate::error::Result<()> {
        for spec in self.params() {
            let Some(expr) = &spec.default else { continue };
            if ctx.contains(&spec.name) {
                continue;
            }
            match engine.eval_expression(&self.origin(&spec.name), expr, ctx) {
                Ok(value) => {
                    tracing::debug!("{}: {} defaults to {}", self.template, spec.name, value);
                    ctx.set(&spec.name, value, Source::Default);
                }
                Err(RenderError::Undefined { name, .. }) => {
                    tracing::debug!(
                        "{}: no default for {} ({} is undefined)",
                        self.template,
                        spec.name,
                        name
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Run every declared check against the values present in `ctx`.
    pub fn run_checks(&self, ctx: &ParameterContext) -> crate::error::Result<()> {
        for spec in self.params() {
            let (Some(check), Some(entry)) = (&spec.check, ctx.entry(&spec.name)) else {
                continue;
            };
            check
                .verify(&entry.value)
                .map_err(|reason| SiteUnitError::InvalidParameter {
                    name: spec.name.clone(),
                    value: entry.value.to_string(),
                    source_layer: entry.source.to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Human-readable parameter listing
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.template, self.description)];

        let mut section = |title: &str, specs: &[ParamSpec]| {
            if specs.is_empty() {
                return;
            }
            lines.push(String::new());
            lines.push(format!("{title}:"));
            for spec in specs {
                let mut line = format!("  {:<22} {}", spec.name, spec.description);
                if let Some(default) = &spec.default {
                    line.push_str(&format!(" (default: {default})"));
                }
                if let Some(check) = &spec.check {
                    line.push_str(&format!(" [{}]", check.describe()));
                }
                lines.push(line);
            }
        };
        section("Required", &self.required);
        section("Optional", &self.optional);

        lines.join("\n")
    }
}

/// Builder for creating TemplateManifest instances
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    template: String,
    description: String,
    required: Vec<ParamSpec>,
    optional: Vec<ParamSpec>,
}

impl ManifestBuilder {
    pub fn new(template: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            description: description.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn require(mut self, spec: ParamSpec) -> Self {
        self.required.push(spec);
        self
    }

    pub fn optional(mut self, spec: ParamSpec) -> Self {
        self.optional.push(spec);
        self
    }

    pub fn build(self) -> Result<TemplateManifest, ManifestError> {
        let manifest = TemplateManifest {
            template: self.template,
            description: self.description,
            required: self.required,
            optional: self.optional,
        };
        manifest.validate_structure()?;
        Ok(manifest)
    }
}

fn spec(name: &str) -> ParamSpec {
    let help = params::lookup(name).map_or("", |d| d.help);
    ParamSpec::new(name, help)
}

/// Manifests of the templates compiled into the binary.
pub fn builtin_manifests() -> Result<Vec<TemplateManifest>, ManifestError> {
    let asuser = || spec("ASUSER").with_default("false");
    let group = || spec("GROUP").with_default("USER");

    Ok(vec![
        TemplateManifest::builder("nginx.conf", "nginx reverse proxy site")
            .require(spec("SERVER_NAME"))
            .optional(spec("TLS").with_default("SSL_CERTIFICATE is defined"))
            .optional(spec("LISTEN").with_default("443 if TLS else 80"))
            .optional(spec("PREFIX").with_default("'/'"))
            .optional(spec("EXPIRES").with_default("'off'"))
            .optional(spec("ACCESS_LOG").with_default("'off'"))
            .optional(spec("CLIENT_MAX_BODY_SIZE").with_default("'4M'"))
            .optional(spec("STATICDIRS").with_default("[]"))
            .optional(spec("ROOT").with_check(ParamCheck::Directory))
            .optional(spec("FAVICON").with_check(ParamCheck::Directory))
            .optional(spec("SSL_CERTIFICATE").with_check(ParamCheck::File))
            .optional(spec("SSL_CERTIFICATE_KEY").with_check(ParamCheck::File))
            .optional(spec("HOST"))
            .optional(spec("SOCKET"))
            .optional(spec("EXTRA"))
            .build()?,
        TemplateManifest::builder("systemd.service", "gunicorn website unit")
            .require(spec("APPLICATION_DIR").with_check(ParamCheck::Directory))
            .require(spec("APPNAME"))
            .require(spec("USER"))
            .require(
                spec("VENV").with_check(ParamCheck::ContainsExecutable("bin/gunicorn".to_string())),
            )
            .require(spec("WORKERS").with_check(ParamCheck::MinInteger(1)))
            .require(spec("LOG_DIR"))
            .optional(asuser())
            .optional(group())
            .optional(spec("STOPWAIT").with_default("10"))
            .optional(spec("ENTRYPOINT").with_default("'app:app'"))
            .optional(spec("HOMEDIR").with_check(ParamCheck::Directory))
            .optional(spec("HOST"))
            .optional(spec("SOCKET"))
            .optional(spec("AFTER"))
            .build()?,
        TemplateManifest::builder("celery.service", "celery background worker unit")
            .require(spec("APPLICATION_DIR").with_check(ParamCheck::Directory))
            .require(spec("APPNAME"))
            .require(spec("USER"))
            .require(spec("VENV").with_check(ParamCheck::ContainsExecutable("bin/celery".to_string())))
            .require(spec("CELERY").with_default("APPNAME ~ '.celery'"))
            .require(spec("LOG_DIR"))
            .optional(asuser())
            .optional(group())
            .optional(spec("WORKERS").with_default("4"))
            .optional(spec("GEVENT").with_default("false"))
            .optional(spec("STOPWAIT").with_default("10"))
            .optional(spec("AFTER"))
            .build()?,
        TemplateManifest::builder("supervisor.ini", "supervisord program entry for the worker")
            .require(spec("APPLICATION_DIR").with_check(ParamCheck::Directory))
            .require(spec("APPNAME"))
            .require(spec("USER"))
            .require(spec("VENV").with_check(ParamCheck::ContainsExecutable("bin/celery".to_string())))
            .require(spec("CELERY").with_default("APPNAME ~ '.celery'"))
            .require(spec("LOG_DIR"))
            .optional(spec("WORKERS").with_default("4"))
            .optional(spec("GEVENT").with_default("false"))
            .optional(spec("STOPWAIT").with_default("10"))
            .optional(spec("HOMEDIR").with_check(ParamCheck::Directory))
            .build()?,
        TemplateManifest::builder("secure-tunnel.service", "persistent ssh port forward")
            .require(spec("TARGET"))
            .require(spec("LOCAL_PORT"))
            .require(spec("REMOTE_PORT"))
            .require(spec("USER"))
            .optional(asuser())
            .optional(spec("LOCAL_ADDR").with_default("'127.0.0.1'"))
            .optional(spec("RESTART").with_default("5").with_check(ParamCheck::MinInteger(3)))
            .optional(spec("REMOTE_USER").with_default("USER"))
            .optional(spec("KEYFILE").with_check(ParamCheck::File))
            .build()?,
        TemplateManifest::builder("tls.fragment", "TLS directives included by nginx.conf")
            .require(spec("SSL_CERTIFICATE"))
            .require(spec("SSL_CERTIFICATE_KEY"))
            .build()?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Layer;
    use crate::engine::NoIncludes;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    // =========================================================================
    // Structure Tests
    // =========================================================================

    #[test]
    fn test_builtin_manifests_are_valid() {
        let manifests = builtin_manifests().unwrap();
        assert_eq!(manifests.len(), 6);
        let nginx = manifests.iter().find(|m| m.template == "nginx.conf").unwrap();
        assert!(nginx.is_required("server_name"));
        assert!(!nginx.is_required("ROOT"));
    }

    #[test]
    fn test_manifest_from_json() {
        let json = r#"{
            "template": "custom.service",
            "description": "Custom unit",
            "required": [
                {"name": "app-dir", "description": "checkout", "check": "directory"}
            ],
            "optional": [
                {"name": "RESTART", "description": "delay", "default": "5", "check": {"min_integer": 3}}
            ]
        }"#;

        let manifest = TemplateManifest::from_json(json).unwrap();
        assert_eq!(manifest.required[0].name, "APP_DIR");
        assert_eq!(manifest.required[0].check, Some(ParamCheck::Directory));
        assert_eq!(manifest.optional[0].check, Some(ParamCheck::MinInteger(3)));
    }

    #[test]
    fn test_duplicate_parameters_rejected() {
        let result = TemplateManifest::builder("x", "x")
            .require(ParamSpec::new("PORT", "a"))
            .optional(ParamSpec::new("port", "b"))
            .build();
        assert!(matches!(result, Err(ManifestError::InvalidFormat { .. })));
    }

    #[test]
    fn test_malformed_default_rejected() {
        let result = TemplateManifest::builder("x", "x")
            .optional(ParamSpec::new("PORT", "a").with_default("80 if"))
            .build();
        assert!(matches!(result, Err(ManifestError::InvalidFormat { .. })));
    }

    // =========================================================================
    // Default Tests
    // =========================================================================

    fn nginx() -> TemplateManifest {
        builtin_manifests()
            .unwrap()
            .into_iter()
            .find(|m| m.template == "nginx.conf")
            .unwrap()
    }

    #[test]
    fn test_defaults_follow_declaration_order() {
        let engine = Engine::new(&NoIncludes);
        let mut ctx = ParameterContext::from_layers([Layer::new(Source::CommandLine)
            .with("SERVER_NAME", "example.org")
            .with("SSL_CERTIFICATE", PathBuf::from("/etc/ssl/site.pem"))]);

        nginx().fill_defaults(&engine, &mut ctx).unwrap();

        assert_eq!(ctx.get("TLS"), Some(&Value::Bool(true)));
        assert_eq!(ctx.get("LISTEN"), Some(&Value::Integer(443)));
        assert_eq!(ctx.get("PREFIX"), Some(&Value::from("/")));
        assert_eq!(ctx.source_of("LISTEN"), Some(Source::Default));
        assert_eq!(ctx.get("STATICDIRS"), Some(&Value::Sequence(vec![])));
    }

    #[test]
    fn test_defaults_never_replace_present_values() {
        let engine = Engine::new(&NoIncludes);
        let mut ctx = ParameterContext::from_layers([Layer::new(Source::EnvironmentFile)
            .with("SERVER_NAME", "example.org")
            .with("LISTEN", 8080i64)]);

        nginx().fill_defaults(&engine, &mut ctx).unwrap();

        assert_eq!(ctx.get("LISTEN"), Some(&Value::Integer(8080)));
        assert_eq!(ctx.source_of("LISTEN"), Some(Source::EnvironmentFile));
        assert_eq!(ctx.get("TLS"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_default_on_undefined_leaves_parameter_unset() {
        let engine = Engine::new(&NoIncludes);
        let manifest = TemplateManifest::builder("t", "t")
            .optional(ParamSpec::new("REMOTE_USER", "").with_default("USER"))
            .build()
            .unwrap();
        let mut ctx = ParameterContext::new();

        manifest.fill_defaults(&engine, &mut ctx).unwrap();

        assert!(!ctx.contains("REMOTE_USER"));
    }

    // =========================================================================
    // Check Tests
    // =========================================================================

    #[test]
    fn test_check_failure_names_source_layer() {
        let manifest = TemplateManifest::builder("t", "t")
            .optional(ParamSpec::new("RESTART", "").with_check(ParamCheck::MinInteger(3)))
            .build()
            .unwrap();
        let ctx = ParameterContext::from_layers([Layer::new(Source::EnvironmentFile).with("RESTART", 2i64)]);

        match manifest.run_checks(&ctx).unwrap_err() {
            SiteUnitError::InvalidParameter {
                name,
                value,
                source_layer,
                ..
            } => {
                assert_eq!(name, "RESTART");
                assert_eq!(value, "2");
                assert_eq!(source_layer, "environment-file");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_contains_executable_check() {
        let venv = TempDir::new().unwrap();
        let check = ParamCheck::ContainsExecutable("bin/gunicorn".to_string());
        let value = Value::Path(venv.path().to_path_buf());
        assert!(check.verify(&value).is_err());

        let bin = venv.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let exe = bin.join("gunicorn");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o644)).unwrap();
        // root passes access(X_OK) for any file with an x bit, so start without one
        assert!(check.verify(&value).is_err());

        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(check.verify(&value).is_ok());
    }

    #[test]
    fn test_directory_and_file_checks() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("key.pem");
        std::fs::write(&file, "x").unwrap();

        assert!(ParamCheck::Directory.verify(&Value::Path(dir.path().to_path_buf())).is_ok());
        assert!(ParamCheck::Directory.verify(&Value::Path(file.clone())).is_err());
        assert!(ParamCheck::File.verify(&Value::Path(file)).is_ok());
        assert!(ParamCheck::File.verify(&Value::Integer(1)).is_err());
    }

    #[test]
    fn test_describe_lists_defaults_and_checks() {
        let text = nginx().describe();
        assert!(text.starts_with("nginx.conf: nginx reverse proxy site"));
        assert!(text.contains("Required:"));
        assert!(text.contains("SERVER_NAME"));
        assert!(text.contains("(default: 443 if TLS else 80)"));
        assert!(text.contains("[existing directory]"));
    }
}
