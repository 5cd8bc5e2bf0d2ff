//! siteunit - main entry point
//!
//! Parses the command line, loads settings, and dispatches to the library.
//! Errors are printed once on stderr and mapped onto the exit status:
//! 1 operational, 2 validation, 3 privilege.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

use siteunit::artifact::{Artifact, ArtifactKind};
use siteunit::cli::{Cli, Commands, GenerateArgs};
use siteunit::config::Settings;
use siteunit::context::ParameterContext;
use siteunit::engine::RenderEnv;
use siteunit::error::SiteUnitError;
use siteunit::generator::Generator;
use siteunit::installer::{InstallManager, InstallOptions};
use siteunit::resolver::{self, ResolveRequest};
use siteunit::runner::SystemRunner;
use siteunit::store::TemplateStore;

/// Initialize logging; `RUST_LOG` overrides the `-v` level.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("siteunit={level}")));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);
    debug!("CLI arguments parsed");

    let code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("siteunit: {:#}", err);
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

/// Exit status for an error, from the first `SiteUnitError` in its chain.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SiteUnitError>())
        .map_or(1, |err| err.exit_class().code())
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load_or_default(cli.config.as_deref())
        .map_err(|err| SiteUnitError::config(format!("{:#}", err)))?;
    if let Some(dir) = cli.state_dir {
        settings.state_dir = Some(dir);
    }

    match cli.command {
        Commands::Render {
            generate,
            output,
            output_dir,
        } => {
            let artifacts = generate_artifacts(&settings, &generate)?;
            write_artifacts(&artifacts, output.as_deref(), output_dir.as_deref())
        }
        Commands::Install { generate, force } => {
            let artifacts = generate_artifacts(&settings, &generate)?;
            let mode = generate.privilege.unwrap_or(settings.privilege);
            let runner = SystemRunner;
            let manager = InstallManager::new(&settings.state_dir(), mode, &runner);
            for artifact in &artifacts {
                let record = manager.install(artifact, InstallOptions { force })?;
                println!("installed {} {} -> {}", record.kind, record.application, record.target_path.display());
            }
            Ok(())
        }
        Commands::Uninstall {
            kinds,
            application,
            privilege,
        } => {
            let kinds = ArtifactKind::parse_list(&kinds)?;
            let mode = privilege.unwrap_or(settings.privilege);
            let runner = SystemRunner;
            let manager = InstallManager::new(&settings.state_dir(), mode, &runner);
            for kind in kinds {
                let record = manager.uninstall(&application, kind)?;
                println!("removed {} {} ({})", record.kind, record.application, record.target_path.display());
            }
            Ok(())
        }
        Commands::List => {
            let runner = SystemRunner;
            let manager = InstallManager::new(&settings.state_dir(), settings.privilege, &runner);
            let records = manager.records()?;
            if records.is_empty() {
                println!("no artifacts installed");
            }
            for record in records {
                println!(
                    "{:<16} {:<17} {:<19} {} {}",
                    record.application,
                    record.kind,
                    record.status,
                    record.installed_at.format("%Y-%m-%d %H:%M:%S"),
                    record.target_path.display()
                );
            }
            Ok(())
        }
        Commands::Describe { kind, template_dir } => {
            let kind = ArtifactKind::parse(&kind)?;
            let template_dir = template_dir.or_else(|| settings.template_dir());
            let store = TemplateStore::load(template_dir.as_deref())?;
            match store.manifest(kind.template_name()) {
                Some(manifest) => println!("{}", manifest.describe()),
                None => println!("{}: no parameters declared", kind.template_name()),
            }
            Ok(())
        }
        Commands::Settings => {
            let json = serde_json::to_string_pretty(&settings).context("Failed to serialize settings")?;
            println!("{}", json);
            Ok(())
        }
    }
}

/// Resolve parameters and render every requested kind.
fn generate_artifacts(settings: &Settings, generate: &GenerateArgs) -> Result<Vec<Artifact>> {
    let kinds = ArtifactKind::parse_list(&generate.kinds)?;
    let context = resolve_context(settings, generate)?;

    let template_dir = generate.template_dir.clone().or_else(|| settings.template_dir());
    let store = TemplateStore::load(template_dir.as_deref())?;
    let generator = Generator::new(store, settings.target_dirs())
        .with_env(RenderEnv {
            command: std::env::args().collect::<Vec<_>>().join(" "),
        })
        .with_checks(!generate.no_check);

    let artifacts = kinds
        .into_iter()
        .map(|kind| generator.generate_kind(kind, &context))
        .collect::<siteunit::Result<Vec<_>>>()?;
    info!("Generated {} artifact(s)", artifacts.len());
    Ok(artifacts)
}

fn resolve_context(settings: &Settings, generate: &GenerateArgs) -> Result<ParameterContext> {
    let (app_dir, mut overrides) = generate.split_positionals();
    if generate.user {
        overrides.push("asuser".to_string());
    }
    let request = ResolveRequest {
        app_dir,
        env_file: generate.env_file.clone(),
        env_file_name: Some(settings.env_file.clone()),
        defaults: settings.defaults.clone(),
        overrides,
        statics: generate.statics.clone(),
        allow_unknown: generate.ignore_unknowns,
    };
    Ok(resolver::resolve(&request)?)
}

fn write_artifacts(artifacts: &[Artifact], output: Option<&Path>, output_dir: Option<&Path>) -> Result<()> {
    if let Some(path) = output {
        let [artifact] = artifacts else {
            return Err(SiteUnitError::config("--output takes a single artifact kind; use --output-dir").into());
        };
        fs::write(path, &artifact.text).with_context(|| format!("Failed to write {:?}", path))?;
        return Ok(());
    }

    if let Some(dir) = output_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        for artifact in artifacts {
            let name = artifact
                .target_path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(artifact.kind.file_name(&artifact.application)));
            let path = dir.join(name);
            fs::write(&path, &artifact.text).with_context(|| format!("Failed to write {:?}", path))?;
            println!("{}", path.display());
        }
        return Ok(());
    }

    for artifact in artifacts {
        print!("{}", artifact.text);
    }
    Ok(())
}
