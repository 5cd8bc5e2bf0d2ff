//! Command-line interface.
//!
//! Subcommands: `render`, `install`, `uninstall`, `list`, `describe`, `settings`.
//! Generating commands take the artifact kinds, an optional application
//! directory and `key=value` parameters as positionals; see
//! [`GenerateArgs::split_positionals`] for how the last two are told apart.

use crate::params;
use crate::privilege::PrivilegeMode;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// siteunit - generate and install web service configuration
#[derive(Parser, Debug)]
#[command(name = "siteunit")]
#[command(about = "Generate nginx, systemd and supervisor configuration for a web application")]
#[command(version)]
pub struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file [default: $XDG_CONFIG_HOME/siteunit/config.json]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for install records, locks and staged files
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render artifacts to stdout or files without installing them
    Render {
        #[command(flatten)]
        generate: GenerateArgs,

        /// Write the artifact to FILE (single kind only)
        #[arg(short, long, value_name = "FILE", conflicts_with = "output_dir")]
        output: Option<PathBuf>,

        /// Write each artifact into DIR, named after its install target
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Render artifacts and install them into the system directories
    Install {
        #[command(flatten)]
        generate: GenerateArgs,

        /// Replace an installed or unmanaged file at the target path
        #[arg(long)]
        force: bool,
    },
    /// Deactivate and remove installed artifacts
    Uninstall {
        /// Comma-separated artifact kinds
        kinds: String,

        /// Application the artifacts were installed for
        application: String,

        /// How to elevate when the target is not writable
        #[arg(long, value_name = "MODE")]
        privilege: Option<PrivilegeMode>,
    },
    /// Show install records
    List,
    /// Show the parameters an artifact kind takes
    Describe {
        /// Artifact kind
        kind: String,

        /// Directory with templates overriding the built-in ones
        #[arg(long)]
        template_dir: Option<PathBuf>,
    },
    /// Print the effective settings as JSON
    Settings,
}

/// Options shared by `render` and `install`
#[derive(Args, Debug, Clone, Default)]
pub struct GenerateArgs {
    /// Comma-separated artifact kinds (proxy-site, service-unit, worker-unit,
    /// supervisor-entry, tunnel-unit)
    pub kinds: String,

    /// Application directory [default: .]
    pub app_dir: Option<String>,

    /// Parameters as key=value; a bare key means true
    pub params: Vec<String>,

    /// Environment file [default: APP_DIR/.env when present]
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Directory with templates overriding the built-in ones
    #[arg(long)]
    pub template_dir: Option<PathBuf>,

    /// Serve DIR under URL (repeatable)
    #[arg(long = "static", value_name = "URL=DIR")]
    pub statics: Vec<String>,

    /// Target the per-user systemd instance
    #[arg(long)]
    pub user: bool,

    /// Skip parameter checks (directories, executables, minimums)
    #[arg(long)]
    pub no_check: bool,

    /// Accept parameters outside the known table
    #[arg(long)]
    pub ignore_unknowns: bool,

    /// How to elevate when the target is not writable
    #[arg(long, value_name = "MODE")]
    pub privilege: Option<PrivilegeMode>,
}

impl GenerateArgs {
    /// Application directory and `key=value` parameters.
    ///
    /// The optional directory shares its position with the parameters, so
    /// a first word that reads as an assignment, or as a bare known
    /// parameter name that is not an existing directory, is a parameter.
    pub fn split_positionals(&self) -> (Option<PathBuf>, Vec<String>) {
        let mut params = self.params.clone();
        let app_dir = match &self.app_dir {
            Some(word) if is_parameter_word(word) => {
                params.insert(0, word.clone());
                None
            }
            Some(word) => Some(PathBuf::from(word)),
            None => None,
        };
        (app_dir, params)
    }
}

fn is_parameter_word(word: &str) -> bool {
    word.contains('=') || (params::is_known(word) && !std::path::Path::new(word).is_dir())
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
