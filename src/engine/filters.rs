//! Filters and functions registered on every template environment.
//!
//! `normpath` passes an undefined input through so that
//! `{{ X|normpath|default(...) }}` works under strict undefined. The other
//! filters report an undefined input as an undefined-value error.

use crate::paths;
use minijinja::value::{Rest, ValueKind};
use minijinja::{Environment, Error, ErrorKind, Value};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Names templates can call that are not parameters.
pub(super) const FUNCTIONS: &[&str] = &["now", "cmd", "join", "range", "dict", "namespace", "debug"];

pub(super) fn register(env: &mut Environment<'_>) {
    env.add_filter("normpath", normpath);
    env.add_filter("split", split);
    env.add_filter("first", first);
    env.add_filter("title", title);
    env.add_function("now", now);
    env.add_function("join", join);
}

fn undefined() -> Error {
    Error::from(ErrorKind::UndefinedError)
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

fn text_of<'v>(value: &'v Value, filter: &str) -> Result<&'v str, Error> {
    if value.is_undefined() {
        return Err(undefined());
    }
    value
        .as_str()
        .ok_or_else(|| invalid(format!("'{filter}' expects a string, got {value}")))
}

fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_word = false;
    for c in input.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

fn normpath(value: &Value) -> Result<Value, Error> {
    if value.is_undefined() {
        return Ok(value.clone());
    }
    let text = text_of(value, "normpath")?;
    Ok(Value::from(paths::clean(Path::new(text)).to_string_lossy().into_owned()))
}

/// Split on `sep`, or on runs of whitespace without one.
fn split(value: &Value, sep: Option<String>) -> Result<Value, Error> {
    let text = text_of(value, "split")?;
    let parts: Vec<String> = match sep.as_deref() {
        None => text.split_whitespace().map(str::to_string).collect(),
        Some("") => return Err(invalid("'split' separator must not be empty".to_string())),
        Some(sep) => text.split(sep).map(str::to_string).collect(),
    };
    Ok(Value::from(parts))
}

/// First item of a sequence or first character of a string; undefined
/// when there is none.
fn first(value: &Value) -> Result<Value, Error> {
    if value.is_undefined() {
        return Err(undefined());
    }
    if let Some(text) = value.as_str() {
        return Ok(text
            .chars()
            .next()
            .map_or(Value::UNDEFINED, |c| Value::from(c.to_string())));
    }
    if value.kind() != ValueKind::Seq {
        return Err(invalid(format!("'first' expects a sequence, got {value}")));
    }
    Ok(value.try_iter()?.next().unwrap_or(Value::UNDEFINED))
}

fn title(value: &Value) -> Result<String, Error> {
    text_of(value, "title").map(title_case)
}

fn now(format: Option<String>) -> Result<String, Error> {
    let format = format.as_deref().unwrap_or("%Y-%m-%d %H:%M:%S");
    let mut out = String::new();
    write!(out, "{}", chrono::Utc::now().format(format))
        .map_err(|_| invalid(format!("invalid time format '{format}'")))?;
    Ok(out)
}

/// Join path components; an absolute component replaces what precedes it.
fn join(parts: Rest<Value>) -> Result<String, Error> {
    if parts.is_empty() {
        return Err(invalid("'join' needs at least one argument".to_string()));
    }
    let mut path = PathBuf::new();
    for part in parts.iter() {
        if part.is_undefined() {
            return Err(undefined());
        }
        match part.kind() {
            ValueKind::String | ValueKind::Number => path.push(part.to_string()),
            _ => return Err(invalid(format!("'join' cannot join {part}"))),
        }
    }
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_case_like_python() {
        assert_eq!(title_case("hello world"), "Hello World");
        assert_eq!(title_case("mY-aPP_name"), "My-App_Name");
        assert_eq!(title_case("élan vital"), "Élan Vital");
    }

    #[test]
    fn test_split_default_whitespace() {
        let out = split(&Value::from("a  b\tc"), None).unwrap();
        assert_eq!(out, Value::from(vec!["a", "b", "c"]));
        assert!(split(&Value::from("a"), Some(String::new())).is_err());
    }

    #[test]
    fn test_first_of_empty_is_undefined() {
        let empty: Vec<Value> = Vec::new();
        assert!(first(&Value::from(empty)).unwrap().is_undefined());
        assert_eq!(first(&Value::from("été")).unwrap(), Value::from("é"));
        assert!(first(&Value::from(3i64)).is_err());
    }

    #[test]
    fn test_join_absolute_component_replaces() {
        let parts = Rest(vec![Value::from("/srv"), Value::from("/etc")]);
        assert_eq!(join(parts).unwrap(), "/etc");
    }

    #[test]
    fn test_normpath_keeps_undefined() {
        assert!(normpath(&Value::UNDEFINED).unwrap().is_undefined());
        assert_eq!(normpath(&Value::from("/a/./b/../c/")).unwrap(), Value::from("/a/c"));
        assert!(normpath(&Value::from(1i64)).is_err());
    }
}
