//! siteunit library
//!
//! Generates nginx server blocks, systemd units and supervisor entries for a
//! web application from templates, and installs them with the matching
//! service manager calls.
//!
//! The pipeline is: [`resolver`] builds a [`ParameterContext`] from layered
//! sources, [`generator`] renders it through the template [`engine`] into
//! [`Artifact`]s, and [`installer`] places and activates them.

pub mod artifact;
pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod generator;
pub mod install_state;
pub mod installer;
pub mod manifest;
pub mod params;
pub mod paths;
pub mod privilege;
pub mod record;
pub mod resolver;
pub mod runner;
pub mod service_manager;
pub mod store;

// Re-export main types for convenience
pub use artifact::{Artifact, ArtifactKind, TargetDirs};
pub use config::Settings;
pub use context::{Layer, ParameterContext, Source};
pub use engine::{Engine, RenderError, Template, Value};
pub use error::{ExitClass, Result, SiteUnitError};
pub use generator::Generator;
pub use install_state::{InstallStage, InstallTracker, InstallTransitionError};
pub use installer::{InstallManager, InstallOptions};
pub use manifest::{ManifestError, ParamCheck, ParamSpec, TemplateManifest};
pub use privilege::PrivilegeMode;
pub use record::{InstallRecord, RecordStatus};
pub use resolver::{ResolveRequest, resolve};
pub use runner::{CommandRunner, CommandSpec, RecordingRunner, SystemRunner};
pub use store::TemplateStore;
