//! Error handling module for siteunit
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Subsystem errors (`RenderError`, `InstallTransitionError`, `ManifestError`)
//! convert into [`SiteUnitError`] so every public operation returns the same
//! `Result` type.
//!
//! Every variant names the parameter, template, or path it concerns so the
//! operator can map a failure back to its cause without reading logs.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for siteunit
#[derive(Error, Debug)]
pub enum SiteUnitError {
    /// A template referenced a parameter that has no value
    #[error("Undefined parameter '{name}' in template '{template}'")]
    UndefinedParameter { name: String, template: String },

    /// A parameter the template declares as required was never supplied
    #[error("Missing required parameter '{name}' for template '{template}'")]
    MissingRequiredParameter { name: String, template: String },

    /// The requested artifact kind has no template
    #[error("Unknown artifact kind '{0}' (see `siteunit describe --help` for the known kinds)")]
    UnknownArtifactKind(String),

    /// An include or lookup named a template that does not exist
    #[error("Unknown template '{name}'")]
    UnknownTemplate { name: String },

    /// The template body could not be parsed
    #[error("Syntax error in template '{template}' at line {line}: {message}")]
    TemplateSyntax {
        template: String,
        line: usize,
        message: String,
    },

    /// Evaluation failed for a reason other than an undefined parameter
    #[error("Render error in template '{template}': {message}")]
    Render { template: String, message: String },

    /// Rendered output failed its structural check
    #[error("Generated {kind} failed validation: {message}")]
    ArtifactValidation { kind: String, message: String },

    /// A parameter value could not be parsed or failed a check
    #[error("Invalid value '{value}' for parameter '{name}' ({source_layer}): {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        source_layer: String,
        reason: String,
    },

    /// A command-line parameter is not in the known-parameter table
    #[error("Unknown parameter '{name}' (use --ignore-unknowns to skip it)")]
    UnknownParameter { name: String },

    /// A typed accessor found a value with a different tag
    #[error("Parameter '{name}' is a {found}, expected a {expected}")]
    ParameterType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The artifact already has an install record
    #[error("{kind} for '{application}' is already installed at {} (use --force to replace it)", target.display())]
    AlreadyInstalled {
        application: String,
        kind: String,
        target: PathBuf,
    },

    /// A file exists at the target path but was not installed by siteunit
    #[error("Refusing to overwrite unmanaged file {} (use --force to replace it)", target.display())]
    UnmanagedTarget { target: PathBuf },

    /// Uninstall found no record for the artifact
    #[error("{kind} for '{application}' is not installed")]
    NotInstalled { application: String, kind: String },

    /// The elevation helper failed, was declined, or is not permitted
    #[error("Privilege elevation failed: {0}")]
    PrivilegeElevation(String),

    /// The service manager rejected the file or failed to (re)start it
    #[error("Activation of {} failed: `{command}`: {message}", target.display())]
    Activation {
        target: PathBuf,
        command: String,
        message: String,
    },

    /// Another invocation holds the lock for this target
    #[error("Target {} is locked by another siteunit process", target.display())]
    Locked { target: PathBuf },

    /// Install state machine transition errors
    #[error("Install transition error: {0}")]
    InstallTransition(String),

    /// Template manifest errors (user template directory)
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A subprocess could not be spawned or exited unsuccessfully
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// IO errors (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for siteunit operations
pub type Result<T> = std::result::Result<T, SiteUnitError>;

/// Coarse classification of an error, mapped onto the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// I/O, activation, lock, or subprocess failure
    Operational,
    /// Bad input: parameters, templates, kinds, records
    Validation,
    /// Elevation helper failed or was not permitted
    Privilege,
}

impl ExitClass {
    /// Process exit status for this class
    pub const fn code(self) -> i32 {
        match self {
            Self::Operational => 1,
            Self::Validation => 2,
            Self::Privilege => 3,
        }
    }
}

// Convenient error constructors
impl SiteUnitError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a privilege elevation error
    pub fn privilege(msg: impl Into<String>) -> Self {
        Self::PrivilegeElevation(msg.into())
    }

    /// Create an artifact validation error
    pub fn validation(kind: impl ToString, msg: impl Into<String>) -> Self {
        Self::ArtifactValidation {
            kind: kind.to_string(),
            message: msg.into(),
        }
    }

    /// Which exit status class this error belongs to
    pub fn exit_class(&self) -> ExitClass {
        match self {
            Self::PrivilegeElevation(_) => ExitClass::Privilege,
            Self::Activation { .. }
            | Self::Locked { .. }
            | Self::Command { .. }
            | Self::Io(_) => ExitClass::Operational,
            Self::UndefinedParameter { .. }
            | Self::MissingRequiredParameter { .. }
            | Self::UnknownArtifactKind(_)
            | Self::UnknownTemplate { .. }
            | Self::TemplateSyntax { .. }
            | Self::Render { .. }
            | Self::ArtifactValidation { .. }
            | Self::InvalidParameter { .. }
            | Self::UnknownParameter { .. }
            | Self::ParameterType { .. }
            | Self::AlreadyInstalled { .. }
            | Self::UnmanagedTarget { .. }
            | Self::NotInstalled { .. }
            | Self::InstallTransition(_)
            | Self::Manifest(_)
            | Self::Config(_)
            | Self::Json(_) => ExitClass::Validation,
        }
    }
}
