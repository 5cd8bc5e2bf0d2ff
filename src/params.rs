//! Known-parameter table and raw value parsing.
//!
//! Environment files are matched against this table (unknown keys are
//! skipped); command-line overrides are checked against it unless unknown
//! names are explicitly allowed. The declared [`ParamType`] decides how a
//! raw `KEY=VALUE` string becomes a [`Value`].

use crate::context::Source;
use crate::engine::Value;
use crate::error::{Result, SiteUnitError};
use crate::paths;
use std::path::Path;
use strum::{Display, EnumString};

/// How a raw string is turned into a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ParamType {
    /// Kept verbatim
    Text,
    /// Decimal integer
    Integer,
    /// true/false, yes/no, on/off, 1/0
    Bool,
    /// Expanded, absolutized, normalized path
    Path,
    /// Integer if it parses, then boolean, otherwise text
    Auto,
    /// Derived from the application directory; cannot be set
    Computed,
}

/// One entry of the known-parameter table
#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub name: &'static str,
    pub kind: ParamType,
    pub help: &'static str,
}

const fn def(name: &'static str, kind: ParamType, help: &'static str) -> ParamDef {
    ParamDef { name, kind, help }
}

/// Every parameter siteunit knows about.
pub const KNOWN: &[ParamDef] = &[
    // application
    def("APPLICATION_DIR", ParamType::Path, "location of the application checkout"),
    def("APPNAME", ParamType::Text, "application name [default: directory name]"),
    def("USER", ParamType::Text, "user to run as [default: current user]"),
    def("GROUP", ParamType::Text, "group to run as [default: the user's primary group]"),
    def("HOMEDIR", ParamType::Path, "$HOME of the service user"),
    def("VENV", ParamType::Path, "virtual environment [default: APPLICATION_DIR/../venv]"),
    def("WORKERS", ParamType::Integer, "number of worker processes [default: CPU*2+1]"),
    def("STOPWAIT", ParamType::Integer, "seconds to wait for the service to stop"),
    def("AFTER", ParamType::Text, "start after this unit"),
    def("HOST", ParamType::Auto, "bind to host:port or a bare port [default: unix socket]"),
    def("PORT", ParamType::Integer, "port the application listens on"),
    def("SOCKET", ParamType::Path, "unix socket path [default: APPLICATION_DIR/app.sock]"),
    def("LOG_DIR", ParamType::Path, "log directory [default: APPLICATION_DIR/logs]"),
    def("ENTRYPOINT", ParamType::Text, "WSGI entry point [default: app:app]"),
    def("ASUSER", ParamType::Bool, "unit is destined for the per-user systemd directory"),
    // proxy site
    def("SERVER_NAME", ParamType::Text, "name of the website"),
    def("ROOT", ParamType::Path, "static files root directory"),
    def("ROOT_PREFIX", ParamType::Text, "location prefix for ROOT"),
    def("PREFIX", ParamType::Text, "url prefix of the application [default: /]"),
    def("EXPIRES", ParamType::Text, "expires header for static files [default: off]"),
    def("LISTEN", ParamType::Auto, "port to listen on [default: 80, 443 with TLS]"),
    def("ACCESS_LOG", ParamType::Text, "'on' or 'off': log static asset requests [default: off]"),
    def("CLIENT_MAX_BODY_SIZE", ParamType::Text, "maximum request body size [default: 4M]"),
    def("EXTRA", ParamType::Text, "extra nginx directives for the proxy location"),
    def("FAVICON", ParamType::Path, "directory holding favicon.ico and robots.txt"),
    def("ROOT_LOCATION_MATCH", ParamType::Text, "regex for top-level static files and directories"),
    def("SSL_CERTIFICATE", ParamType::Path, "TLS certificate chain"),
    def("SSL_CERTIFICATE_KEY", ParamType::Path, "TLS private key"),
    def("TLS", ParamType::Bool, "serve over TLS [default: true when SSL_CERTIFICATE is set]"),
    def("STATICDIRS", ParamType::Computed, "static mounts from ROOT and --static"),
    def("ERROR_PAGE", ParamType::Computed, "static mount containing 404.html"),
    // background worker
    def("CELERY", ParamType::Text, "celery --app to start [default: <package>.celery]"),
    def("GEVENT", ParamType::Bool, "run the worker pool with gevent"),
    // tunnel
    def("TARGET", ParamType::Text, "ssh destination host"),
    def("LOCAL_PORT", ParamType::Integer, "local port to forward"),
    def("REMOTE_PORT", ParamType::Integer, "remote port to connect to"),
    def("LOCAL_ADDR", ParamType::Text, "local address to bind [default: 127.0.0.1]"),
    def("KEYFILE", ParamType::Path, "ssh identity file"),
    def("REMOTE_USER", ParamType::Text, "remote user [default: USER]"),
    def("RESTART", ParamType::Integer, "seconds before restart [default: 5]"),
];

/// Top-level directories served straight from the static root
pub const STATIC_DIRS: &[&str] = &[
    "img", "images", "js", "css", "media", "docs", "tutorials", "notebooks", "downloads", "help",
    ".well-known",
];

/// Top-level files served straight from the static root
pub const STATIC_FILES: &[&str] = &[
    "robots.txt",
    "crossdomain.xml",
    "favicon.ico",
    "browserconfig.xml",
    "humans.txt",
];

/// Canonical spelling: upper case, `-` replaced by `_`.
pub fn canonical(name: &str) -> String {
    name.trim().replace('-', "_").to_ascii_uppercase()
}

pub fn lookup(name: &str) -> Option<&'static ParamDef> {
    let name = canonical(name);
    KNOWN.iter().find(|d| d.name == name)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse `raw` according to the declared type of `name`.
///
/// Relative paths are taken relative to the working directory.
pub fn parse_value(name: &str, raw: &str, source: Source) -> Result<Value> {
    parse_value_in(name, raw, source, None)
}

/// Like [`parse_value`], but relative paths are joined onto `base`.
pub fn parse_value_in(name: &str, raw: &str, source: Source, base: Option<&Path>) -> Result<Value> {
    let name = canonical(name);
    let invalid = |reason: &str| SiteUnitError::InvalidParameter {
        name: name.clone(),
        value: raw.to_string(),
        source_layer: source.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("empty value"));
    }

    let kind = lookup(&name).map_or(ParamType::Auto, |d| d.kind);
    match kind {
        ParamType::Text => Ok(Value::String(raw.to_string())),
        ParamType::Integer => raw
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("expected an integer")),
        ParamType::Bool => parse_bool(raw)
            .map(Value::Bool)
            .ok_or_else(|| invalid("expected true or false")),
        ParamType::Path => {
            let path = Path::new(raw);
            let path = match base {
                Some(base) if path.is_relative() && !raw.starts_with('~') => base.join(path),
                _ => path.to_path_buf(),
            };
            Ok(Value::Path(paths::clean(&path)))
        }
        ParamType::Auto => Ok(match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => raw
                .parse::<i64>()
                .map_or_else(|_| Value::String(raw.to_string()), Value::Integer),
        }),
        ParamType::Computed => Err(invalid("computed from the application directory")),
    }
}

/// Split a `key=value` argument; a bare `key` means `true`.
pub fn parse_assignment(arg: &str, source: Source) -> Result<(String, Value)> {
    match arg.split_once('=') {
        Some((key, raw)) => {
            let key = canonical(key);
            let value = parse_value(&key, raw.trim(), source)?;
            Ok((key, value))
        }
        None => Ok((canonical(arg), Value::Bool(true))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_canonical_names() {
        assert_eq!(canonical("local-port"), "LOCAL_PORT");
        assert_eq!(canonical(" server_name "), "SERVER_NAME");
        assert!(is_known("remote-user"));
        assert!(!is_known("UNKNOWN_KEY"));
        assert!(!is_known("DEPOT_PATH"));
    }

    #[test]
    fn test_table_has_no_duplicates() {
        for (i, a) in KNOWN.iter().enumerate() {
            assert!(KNOWN[i + 1..].iter().all(|b| b.name != a.name), "{} listed twice", a.name);
            assert_eq!(canonical(a.name), a.name);
        }
    }

    #[test]
    fn test_typed_parsing() {
        let cli = Source::CommandLine;
        assert_eq!(parse_value("PORT", "9000", cli).unwrap(), Value::Integer(9000));
        assert_eq!(parse_value("USER", "1000", cli).unwrap(), Value::from("1000"));
        assert_eq!(parse_value("gevent", "yes", cli).unwrap(), Value::Bool(true));
        assert_eq!(
            parse_value("ROOT", "/srv/app/../www", cli).unwrap(),
            Value::Path(PathBuf::from("/srv/www"))
        );
        assert_eq!(parse_value("HOST", "8000", cli).unwrap(), Value::Integer(8000));
        assert_eq!(
            parse_value("HOST", "10.0.0.1:8000", cli).unwrap(),
            Value::from("10.0.0.1:8000")
        );
        assert_eq!(parse_value("CUSTOM", "false", cli).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_relative_paths_join_base() {
        let base = Path::new("/srv/shop");
        assert_eq!(
            parse_value_in("ROOT", "static", Source::EnvironmentFile, Some(base)).unwrap(),
            Value::Path(PathBuf::from("/srv/shop/static"))
        );
        assert_eq!(
            parse_value_in("ROOT", "/var/www", Source::EnvironmentFile, Some(base)).unwrap(),
            Value::Path(PathBuf::from("/var/www"))
        );
    }

    #[test]
    fn test_invalid_values_name_key_and_source() {
        let err = parse_value("workers", "many", Source::EnvironmentFile).unwrap_err();
        match err {
            SiteUnitError::InvalidParameter {
                name,
                value,
                source_layer,
                ..
            } => {
                assert_eq!(name, "WORKERS");
                assert_eq!(value, "many");
                assert_eq!(source_layer, "environment-file");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_value("STATICDIRS", "/x", Source::CommandLine).is_err());
        assert!(parse_value("APPNAME", "", Source::CommandLine).is_err());
    }

    #[test]
    fn test_assignment_forms() {
        let (k, v) = parse_assignment("asuser", Source::CommandLine).unwrap();
        assert_eq!((k.as_str(), v), ("ASUSER", Value::Bool(true)));
        let (k, v) = parse_assignment("local-port=8001", Source::CommandLine).unwrap();
        assert_eq!((k.as_str(), v), ("LOCAL_PORT", Value::Integer(8001)));
        assert!(parse_assignment("server_name=", Source::CommandLine).is_err());
    }
}
