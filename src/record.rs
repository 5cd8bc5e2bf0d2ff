//! Install records kept under the state directory.
//!
//! One JSON file per (application, kind) at
//! `<state>/records/<application>/<kind>.json`. A record is the only
//! evidence that siteunit owns a target file.

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::{Result, SiteUnitError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RecordStatus {
    Installed,
    /// Placed, but activating it with the service manager failed
    NeedsVerification,
}

/// What was installed, where, and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub application: String,
    pub kind: ArtifactKind,
    pub target_path: PathBuf,
    /// Name the service manager knows the artifact by
    pub service: String,
    pub user_scope: bool,
    /// Placement went through sudo or su
    pub elevated: bool,
    pub installed_at: DateTime<Utc>,
    /// Rendered length in bytes
    pub length: usize,
    pub status: RecordStatus,
}

impl InstallRecord {
    pub fn new(artifact: &Artifact, elevated: bool, status: RecordStatus) -> Self {
        Self {
            application: artifact.application.clone(),
            kind: artifact.kind,
            target_path: artifact.target_path.clone(),
            service: artifact.service_name(),
            user_scope: artifact.user_scope,
            elevated,
            installed_at: Utc::now(),
            length: artifact.text.len(),
            status,
        }
    }
}

/// Record files under one state directory
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("records"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, application: &str, kind: ArtifactKind) -> Result<PathBuf> {
        if application.is_empty()
            || application.starts_with('.')
            || application.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(SiteUnitError::config(format!(
                "'{application}' cannot be used as an application name"
            )));
        }
        Ok(self.root.join(application).join(format!("{kind}.json")))
    }

    pub fn load(&self, application: &str, kind: ArtifactKind) -> Result<Option<InstallRecord>> {
        let path = self.path(application, kind)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    /// Write `record`, replacing any previous one atomically.
    pub fn save(&self, record: &InstallRecord) -> Result<()> {
        let path = self.path(&record.application, record.kind)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!("Wrote install record {}", path.display());
        Ok(())
    }

    /// Delete a record; returns whether one existed.
    pub fn remove(&self, application: &str, kind: ArtifactKind) -> Result<bool> {
        let path = self.path(application, kind)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        if let Some(dir) = path.parent() {
            // only succeeds once the application has no records left
            let _ = fs::remove_dir(dir);
        }
        Ok(true)
    }

    /// Every record, ordered by application then kind.
    pub fn all(&self) -> Result<Vec<InstallRecord>> {
        let mut records = Vec::new();
        if !self.root.is_dir() {
            return Ok(records);
        }
        for app in fs::read_dir(&self.root)? {
            let app = app?.path();
            if !app.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&app)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    let content = fs::read_to_string(&path)?;
                    match serde_json::from_str::<InstallRecord>(&content) {
                        Ok(record) => records.push(record),
                        Err(err) => tracing::warn!("Skipping unreadable record {}: {}", path.display(), err),
                    }
                }
            }
        }
        records.sort_by(|a, b| (&a.application, a.kind).cmp(&(&b.application, b.kind)));
        Ok(records)
    }
}
