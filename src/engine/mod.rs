//! Template engine for unit and site files.
//!
//! Templates are Jinja documents rendered with [`minijinja`]:
//!
//! ```text
//! {{ expr }}                          interpolation
//! {% if cond %} {% elif %} {% else %} {% endif %}
//! {% for item in SEQ %} {% endfor %}
//! {% include "name" %}                splice another template
//! {# comment #}
//! ```
//!
//! # Design Principles
//!
//! - **Strict undefined**: an undefined value may only reach `default`,
//!   `normpath` or `is defined`; anything else fails naming the parameter
//! - **Case-insensitive names**: `{{ server_name }}` reads `SERVER_NAME`
//! - **Plain text**: nothing is escaped, whatever the template is called
//! - **Single pass**: rendering never mutates the context, and only `now()`
//!   makes output depend on anything but the template and the context
//!
//! # Whitespace
//!
//! `trim_blocks` and `lstrip_blocks` are on, so a block tag that stands
//! alone on its line disappears together with its indentation and its
//! newline. `-` inside a delimiter strips all whitespace on that side;
//! `{%+` keeps the indentation. A template's final newline is kept, which
//! lets an included fragment end its last line.

mod filters;
pub mod value;

pub use value::Value;

use minijinja::value::{Enumerator, Object};
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while parsing or rendering a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A value was used without a default or an `is defined` guard
    #[error("Undefined parameter '{name}' in template '{template}'")]
    Undefined { name: String, template: String },

    /// `{% include %}` named a template the source does not have
    #[error("Unknown template '{name}'")]
    UnknownTemplate { name: String },

    /// The template body is malformed
    #[error("Syntax error in template '{template}' at line {line}: {message}")]
    Syntax {
        template: String,
        line: usize,
        message: String,
    },

    /// A filter, function, or operator was given a value it cannot handle
    #[error("Render error in template '{template}': {message}")]
    Eval { template: String, message: String },
}

impl From<RenderError> for crate::error::SiteUnitError {
    fn from(err: RenderError) -> Self {
        use crate::error::SiteUnitError;
        match err {
            RenderError::Undefined { name, template } => {
                SiteUnitError::UndefinedParameter { name, template }
            }
            RenderError::UnknownTemplate { name } => SiteUnitError::UnknownTemplate { name },
            RenderError::Syntax {
                template,
                line,
                message,
            } => SiteUnitError::TemplateSyntax {
                template,
                line,
                message,
            },
            RenderError::Eval { template, message } => {
                SiteUnitError::Render { template, message }
            }
        }
    }
}

/// Parameter lookup used by the engine.
///
/// The engine does not know where a value came from; implementors decide
/// name canonicalization.
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<&Value>;

    /// Every defined name with its value
    fn entries(&self) -> Vec<(&str, &Value)>;
}

impl Lookup for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name).or_else(|| self.get(&name.to_ascii_uppercase()))
    }

    fn entries(&self) -> Vec<(&str, &Value)> {
        self.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }
}

/// Templates reachable through `{% include %}`, keyed by name
pub type TemplateMap = Arc<BTreeMap<String, Template>>;

/// Named templates available to `{% include %}`.
pub trait TemplateSource {
    fn templates(&self) -> TemplateMap;
}

/// An empty source: includes always fail.
pub struct NoIncludes;

impl TemplateSource for NoIncludes {
    fn templates(&self) -> TemplateMap {
        TemplateMap::default()
    }
}

/// Facts about the invocation exposed through template functions.
#[derive(Debug, Clone, Default)]
pub struct RenderEnv {
    /// Returned by `cmd()`
    pub command: String,
}

/// A template whose syntax has been checked. Immutable once built.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    source: String,
}

impl Template {
    /// Check `source` and keep it as a template called `name`.
    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self, RenderError> {
        let name = name.into();
        check_syntax(&name, source)?;
        Ok(Self {
            name,
            source: source.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// The render context: parameter values, looked up case-insensitively.
#[derive(Debug)]
struct Parameters(BTreeMap<String, minijinja::Value>);

impl Parameters {
    fn from_lookup(context: &dyn Lookup) -> minijinja::Value {
        let values = context
            .entries()
            .into_iter()
            .map(|(name, value)| (name.to_string(), minijinja::Value::from(value)))
            .collect();
        minijinja::Value::from_object(Self(values))
    }
}

impl Object for Parameters {
    fn get_value(self: &Arc<Self>, key: &minijinja::Value) -> Option<minijinja::Value> {
        let name = key.as_str()?;
        self.0
            .get(name)
            .or_else(|| self.0.get(&name.to_ascii_uppercase()))
            .cloned()
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(
            self.0
                .keys()
                .map(|name| minijinja::Value::from(name.as_str()))
                .collect(),
        )
    }
}

/// Settings and filters shared by every environment.
fn base_environment<'a>() -> Environment<'a> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    filters::register(&mut env);
    env
}

/// Renders templates against a lookup.
pub struct Engine {
    templates: TemplateMap,
    env: RenderEnv,
}

impl Engine {
    pub fn new(source: &dyn TemplateSource) -> Self {
        Self {
            templates: source.templates(),
            env: RenderEnv::default(),
        }
    }

    pub fn with_env(mut self, env: RenderEnv) -> Self {
        self.env = env;
        self
    }

    /// Environment whose loader serves this engine's templates.
    fn environment<'a>(&self) -> Environment<'a> {
        let mut env = base_environment();
        let templates = Arc::clone(&self.templates);
        env.set_loader(move |name| Ok(templates.get(name).map(|t| t.source.clone())));
        let command = self.env.command.clone();
        env.add_function("cmd", move || command.clone());
        env
    }

    /// Render `template` against `context`.
    pub fn render(&self, template: &Template, context: &dyn Lookup) -> Result<String, RenderError> {
        let env = self.environment();
        let compiled = env
            .template_from_named_str(&template.name, &template.source)
            .map_err(|err| convert(&err, &template.name))?;
        let out = compiled
            .render(Parameters::from_lookup(context))
            .map_err(|err| self.render_failure(template, context, &err))?;
        tracing::debug!("Rendered template '{}' ({} bytes)", template.name, out.len());
        Ok(out)
    }

    /// Evaluate a standalone expression, as used by manifest defaults.
    ///
    /// The result may be `Undefined`; strictness applies only inside the
    /// expression (e.g. `A ~ B` with `A` undefined is an error).
    pub fn eval_expression(
        &self,
        origin: &str,
        expression: &str,
        context: &dyn Lookup,
    ) -> Result<Value, RenderError> {
        let env = self.environment();
        let compiled = env
            .compile_expression(expression)
            .map_err(|err| convert(&err, origin))?;
        let result = compiled.eval(Parameters::from_lookup(context)).map_err(|err| {
            let name = (err.kind() == ErrorKind::UndefinedError)
                .then(|| undefined_name(&format!("{{{{ {expression} }}}}"), Some(1), context))
                .flatten();
            match name {
                Some(name) => RenderError::Undefined {
                    name,
                    template: origin.to_string(),
                },
                None => convert(&err, origin),
            }
        })?;
        Value::from_jinja(&result).map_err(|message| RenderError::Eval {
            template: origin.to_string(),
            message,
        })
    }

    /// Attach the parameter name to an undefined-value failure, which may
    /// have happened inside an included template.
    fn render_failure(&self, top: &Template, context: &dyn Lookup, err: &minijinja::Error) -> RenderError {
        let failed = err.name().unwrap_or(top.name.as_str()).to_string();
        if err.kind() == ErrorKind::UndefinedError {
            let source = if failed == top.name {
                Some(top.source.as_str())
            } else {
                self.templates.get(&failed).map(|t| t.source.as_str())
            };
            if let Some(name) = source.and_then(|s| undefined_name(s, err.line(), context)) {
                return RenderError::Undefined { name, template: failed };
            }
        }
        convert(err, &top.name)
    }
}

/// Check that `expression` parses, without evaluating it.
pub fn validate_expression(origin: &str, expression: &str) -> Result<(), RenderError> {
    let env = base_environment();
    env.compile_expression(expression)
        .map(drop)
        .map_err(|err| convert(&err, origin))
}

fn check_syntax(name: &str, source: &str) -> Result<(), RenderError> {
    let env = base_environment();
    env.template_from_named_str(name, source)
        .map(drop)
        .map_err(|err| convert(&err, name))
}

/// The parameter an undefined-value error at `line` of `source` is about:
/// a name the template reads that `context` lacks, preferring one written
/// on that line. Returned in canonical upper case.
fn undefined_name(source: &str, line: Option<usize>, context: &dyn Lookup) -> Option<String> {
    let env = base_environment();
    let compiled = env.template_from_str(source).ok()?;
    let missing: BTreeSet<String> = compiled
        .undeclared_variables(false)
        .into_iter()
        .filter(|name| !filters::FUNCTIONS.contains(&name.as_str()) && context.lookup(name).is_none())
        .collect();
    let line_text = line
        .and_then(|n| source.lines().nth(n.saturating_sub(1)))
        .unwrap_or_default();
    missing
        .iter()
        .find(|name| mentions(line_text, name))
        .or_else(|| missing.iter().next())
        .map(|name| name.to_ascii_uppercase())
}

/// Whether `name` occurs in `text` as a whole identifier.
fn mentions(text: &str, name: &str) -> bool {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    text.match_indices(name).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

fn describe(err: &minijinja::Error) -> String {
    match err.detail() {
        Some(detail) => format!("{}: {detail}", err.kind()),
        None => err.kind().to_string(),
    }
}

fn convert(err: &minijinja::Error, fallback: &str) -> RenderError {
    let template = err.name().unwrap_or(fallback).to_string();
    match err.kind() {
        ErrorKind::SyntaxError => RenderError::Syntax {
            template,
            line: err.line().unwrap_or(1),
            message: describe(err),
        },
        ErrorKind::TemplateNotFound => RenderError::UnknownTemplate {
            name: err
                .detail()
                .and_then(|detail| detail.split('"').nth(1))
                .unwrap_or(template.as_str())
                .to_string(),
        },
        _ => RenderError::Eval {
            template,
            message: describe(err),
        },
    }
}
