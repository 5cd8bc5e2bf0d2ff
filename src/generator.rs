//! Artifact generation.
//!
//! # Design Principles
//!
//! - **Caller's context is never modified**: each artifact works on its own
//!   copy, so defaults filled for one kind do not leak into the next
//! - **Fail before output**: checks run before rendering, structural
//!   validation before anything is returned

use crate::artifact::{Artifact, ArtifactKind, TargetDirs, validate_artifact};
use crate::context::ParameterContext;
use crate::engine::{Engine, RenderEnv, RenderError, Value};
use crate::error::{Result, SiteUnitError};
use crate::store::TemplateStore;

/// Renders artifacts from a template store.
#[derive(Debug)]
pub struct Generator {
    store: TemplateStore,
    dirs: TargetDirs,
    env: RenderEnv,
    check: bool,
}

impl Generator {
    pub fn new(store: TemplateStore, dirs: TargetDirs) -> Self {
        Self {
            store,
            dirs,
            env: RenderEnv::default(),
            check: true,
        }
    }

    pub fn with_env(mut self, env: RenderEnv) -> Self {
        self.env = env;
        self
    }

    /// Enable or disable parameter checks
    pub fn with_checks(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn dirs(&self) -> &TargetDirs {
        &self.dirs
    }

    /// Generate the artifact named by `kind`.
    pub fn generate(&self, kind: &str, ctx: &ParameterContext) -> Result<Artifact> {
        self.generate_kind(ArtifactKind::parse(kind)?, ctx)
    }

    /// Generate several artifacts from one context.
    ///
    /// Every kind name is checked before anything is rendered.
    pub fn generate_all<S: AsRef<str>>(&self, kinds: &[S], ctx: &ParameterContext) -> Result<Vec<Artifact>> {
        let kinds = kinds
            .iter()
            .map(|k| ArtifactKind::parse(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        kinds.into_iter().map(|kind| self.generate_kind(kind, ctx)).collect()
    }

    pub fn generate_kind(&self, kind: ArtifactKind, ctx: &ParameterContext) -> Result<Artifact> {
        let template_name = kind.template_name();
        let template = self.store.get(template_name)?;
        let manifest = self.store.manifest(template_name);
        let engine = Engine::new(&self.store).with_env(self.env.clone());

        let mut ctx = ctx.clone();
        prepare(kind, &mut ctx);

        if let Some(manifest) = manifest {
            manifest.fill_defaults(&engine, &mut ctx)?;
            if self.check {
                manifest.run_checks(&ctx)?;
            }
        }

        // An undefined parameter is "missing" when the template it failed in
        // requires it, which may be an included fragment.
        let mut text = engine.render(template, &ctx).map_err(|err| match err {
            RenderError::Undefined { name, template }
                if self.store.manifest(&template).is_some_and(|m| m.is_required(&name)) =>
            {
                SiteUnitError::MissingRequiredParameter { name, template }
            }
            other => other.into(),
        })?;
        if !text.ends_with('\n') {
            text.push('\n');
        }

        let tls = flag(&ctx, "TLS");
        validate_artifact(kind, &text, tls)?;

        let application = kind.stem(&ctx)?;
        let user_scope = kind.is_systemd_unit() && flag(&ctx, "ASUSER");
        let target_path = self.dirs.target_path(kind, &application, user_scope);
        tracing::debug!(
            "Generated {} for {} ({} bytes) -> {}",
            kind,
            application,
            text.len(),
            target_path.display()
        );

        Ok(Artifact {
            kind,
            application,
            text,
            target_path,
            user_scope,
        })
    }
}

fn flag(ctx: &ParameterContext, name: &str) -> bool {
    ctx.get(name).and_then(Value::truthy).unwrap_or(false)
}

/// Per-kind adjustments made before defaults are filled.
fn prepare(kind: ArtifactKind, ctx: &mut ParameterContext) {
    let Some(address) = kind.host_address() else {
        return;
    };
    if let Some(entry) = ctx.entry("HOST") {
        if let Value::Integer(port) = entry.value {
            let source = entry.source;
            ctx.set("HOST", format!("{address}:{port}"), source);
        }
    }
}
