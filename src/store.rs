//! Template store: built-in templates and manifests, optionally overlaid
//! by a user directory.
//!
//! A file in the template directory replaces the built-in of the same
//! name. `<name>.json` beside it is read as that template's manifest;
//! without one a replaced built-in keeps its built-in manifest.

use crate::engine::{Template, TemplateMap, TemplateSource};
use crate::error::{Result, SiteUnitError};
use crate::manifest::{self, ManifestError, TemplateManifest};
use std::collections::BTreeMap;
use std::path::Path;

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("nginx.conf", include_str!("../templates/nginx.conf")),
    ("tls.fragment", include_str!("../templates/tls.fragment")),
    ("systemd.service", include_str!("../templates/systemd.service")),
    ("celery.service", include_str!("../templates/celery.service")),
    ("supervisor.ini", include_str!("../templates/supervisor.ini")),
    ("secure-tunnel.service", include_str!("../templates/secure-tunnel.service")),
];

/// Parsed templates and their manifests, keyed by template name
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: TemplateMap,
    manifests: BTreeMap<String, TemplateManifest>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The templates compiled into the binary
    pub fn builtin() -> Result<Self> {
        let mut store = Self::new();
        for (name, source) in BUILTIN_TEMPLATES {
            store.insert_template(name, source)?;
        }
        for manifest in manifest::builtin_manifests()? {
            store.register_manifest(manifest);
        }
        Ok(store)
    }

    /// Built-ins, overlaid by `template_dir` when given.
    pub fn load(template_dir: Option<&Path>) -> Result<Self> {
        let mut store = Self::builtin()?;
        if let Some(dir) = template_dir {
            let count = store.overlay_dir(dir)?;
            tracing::debug!("Loaded {} files from template directory {}", count, dir.display());
        }
        Ok(store)
    }

    /// Parse and add a template, replacing any of the same name.
    pub fn insert_template(&mut self, name: &str, source: &str) -> Result<()> {
        let template = Template::parse(name, source)?;
        std::sync::Arc::make_mut(&mut self.templates).insert(name.to_string(), template);
        Ok(())
    }

    pub fn register_manifest(&mut self, manifest: TemplateManifest) {
        self.manifests.insert(manifest.template.clone(), manifest);
    }

    /// Read every regular file in `dir`; returns how many were loaded.
    pub fn overlay_dir(&mut self, dir: &Path) -> Result<usize> {
        let unreadable = |err: std::io::Error| {
            SiteUnitError::config(format!("cannot read template directory {}: {err}", dir.display()))
        };
        let mut count = 0;

        for entry in std::fs::read_dir(dir).map_err(unreadable)? {
            let path = entry.map_err(unreadable)?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('.') || !path.is_file() {
                continue;
            }

            if let Some(template) = file_name.strip_suffix(".json") {
                let manifest = TemplateManifest::from_file(&path)?;
                if manifest.template != template {
                    return Err(ManifestError::InvalidFormat {
                        reason: format!(
                            "{} describes '{}', expected '{template}'",
                            path.display(),
                            manifest.template
                        ),
                    }
                    .into());
                }
                self.register_manifest(manifest);
            } else {
                let source = std::fs::read_to_string(&path).map_err(unreadable)?;
                self.insert_template(file_name, &source)?;
                tracing::debug!("Template {} overridden by {}", file_name, path.display());
            }
            count += 1;
        }

        Ok(count)
    }

    pub fn get(&self, name: &str) -> Result<&Template> {
        self.templates
            .get(name)
            .ok_or_else(|| SiteUnitError::UnknownTemplate {
                name: name.to_string(),
            })
    }

    pub fn manifest(&self, name: &str) -> Option<&TemplateManifest> {
        self.manifests.get(name)
    }

    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

impl TemplateSource for TemplateStore {
    fn templates(&self) -> TemplateMap {
        TemplateMap::clone(&self.templates)
    }
}
