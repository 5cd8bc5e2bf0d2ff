//! Tagged parameter values and their template form.
//!
//! Truthiness is defined per tag. `Undefined` has none: asking an undefined
//! value whether it is true, or printing it, is an error the engine reports
//! with the parameter's name. Paths reach templates as plain strings, so
//! a value read back from an expression never carries the `Path` tag.

use minijinja::value::ValueKind;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A parameter or expression value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Integer(i64),
    Bool(bool),
    Path(PathBuf),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    Undefined,
}

impl Value {
    /// Tag name used in error messages
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Bool(_) => "boolean",
            Self::Path(_) => "path",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
            Self::Undefined => "undefined",
        }
    }

    #[inline]
    pub const fn is_defined(&self) -> bool {
        !matches!(self, Self::Undefined)
    }

    /// Truthiness of a defined value, `None` for `Undefined`.
    ///
    /// Paths are always true: an empty path cannot be constructed by the
    /// resolver, so there is no "falsy" path.
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Self::String(s) => Some(!s.is_empty()),
            Self::Integer(n) => Some(*n != 0),
            Self::Bool(b) => Some(*b),
            Self::Path(_) => Some(true),
            Self::Sequence(items) => Some(!items.is_empty()),
            Self::Mapping(map) => Some(!map.is_empty()),
            Self::Undefined => None,
        }
    }

    /// Plain text for a scalar, as shown by `describe` and in messages.
    ///
    /// Sequences become their items separated by a single space.
    pub fn render_text(&self) -> Result<String, &'static str> {
        match self {
            Self::String(s) => Ok(s.clone()),
            Self::Integer(n) => Ok(n.to_string()),
            Self::Bool(b) => Ok(b.to_string()),
            Self::Path(p) => Ok(p.to_string_lossy().into_owned()),
            Self::Sequence(items) => {
                let parts = items
                    .iter()
                    .map(Value::render_text)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(parts.join(" "))
            }
            Self::Mapping(_) => Err("a mapping cannot be rendered as text"),
            Self::Undefined => Err("an undefined value cannot be rendered"),
        }
    }

    /// Attribute lookup: exact key first, then a case-insensitive match.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Mapping(map) => map.get(name).or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl Value {
    /// Read back the result of an expression.
    ///
    /// `none` counts as undefined; numbers must be integers.
    pub fn from_jinja(value: &minijinja::Value) -> Result<Self, String> {
        match value.kind() {
            ValueKind::Undefined | ValueKind::None => Ok(Self::Undefined),
            ValueKind::Bool => Ok(Self::Bool(value.is_true())),
            ValueKind::Number => i64::try_from(value.clone())
                .map(Self::Integer)
                .map_err(|_| format!("{value} is not an integer")),
            ValueKind::String => Ok(Self::String(value.to_string())),
            ValueKind::Seq => value
                .try_iter()
                .map_err(|e| e.to_string())?
                .map(|item| Self::from_jinja(&item))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Sequence),
            ValueKind::Map => {
                let mut map = BTreeMap::new();
                for key in value.try_iter().map_err(|e| e.to_string())? {
                    let item = value.get_item(&key).map_err(|e| e.to_string())?;
                    map.insert(key.to_string(), Self::from_jinja(&item)?);
                }
                Ok(Self::Mapping(map))
            }
            _ => Err(format!("{value} cannot be a parameter value")),
        }
    }
}

impl From<&Value> for minijinja::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::from(s.as_str()),
            Value::Integer(n) => Self::from(*n),
            Value::Bool(b) => Self::from(*b),
            Value::Path(p) => Self::from(p.to_string_lossy().into_owned()),
            Value::Sequence(items) => Self::from(items.iter().map(Self::from).collect::<Vec<_>>()),
            Value::Mapping(map) => Self::from(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect::<BTreeMap<_, _>>(),
            ),
            Value::Undefined => Self::UNDEFINED,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapping(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Undefined => write!(f, "<undefined>"),
            other => match other.render_text() {
                Ok(text) => write!(f, "{text}"),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Self::Path(p.to_path_buf())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Sequence(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Mapping(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_per_tag() {
        assert_eq!(Value::from("").truthy(), Some(false));
        assert_eq!(Value::from("0").truthy(), Some(true));
        assert_eq!(Value::from(0i64).truthy(), Some(false));
        assert_eq!(Value::from(false).truthy(), Some(false));
        assert_eq!(Value::from(PathBuf::from("/")).truthy(), Some(true));
        assert_eq!(Value::Sequence(vec![]).truthy(), Some(false));
        assert_eq!(Value::Undefined.truthy(), None);
    }

    #[test]
    fn test_tags_never_compare_equal() {
        assert_ne!(Value::from("1"), Value::from(1i64));
        assert_ne!(Value::from("true"), Value::from(true));
        assert_ne!(Value::from("/srv"), Value::from(PathBuf::from("/srv")));
    }

    #[test]
    fn test_sequence_renders_space_separated() {
        let seq = Value::from(vec![Value::from("a"), Value::from(2i64)]);
        assert_eq!(seq.render_text().unwrap(), "a 2");
        assert!(Value::Mapping(BTreeMap::new()).render_text().is_err());
    }

    #[test]
    fn test_template_form_reads_back() {
        let mut mount = BTreeMap::new();
        mount.insert("dir".to_string(), Value::from(PathBuf::from("/srv/s")));
        mount.insert("toplevel".to_string(), Value::from(true));
        let value = Value::from(vec![Value::Mapping(mount), Value::from(3i64)]);

        let back = Value::from_jinja(&minijinja::Value::from(&value)).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert("dir".to_string(), Value::from("/srv/s"));
        expected.insert("toplevel".to_string(), Value::from(true));
        assert_eq!(back, Value::from(vec![Value::Mapping(expected), Value::from(3i64)]));
        assert_eq!(Value::from_jinja(&minijinja::Value::UNDEFINED).unwrap(), Value::Undefined);
        assert!(Value::from_jinja(&minijinja::Value::from(1.5f64)).is_err());
    }

    #[test]
    fn test_attr_falls_back_to_case_insensitive() {
        let mut map = BTreeMap::new();
        map.insert("URL".to_string(), Value::from("/static"));
        let value = Value::from(map);
        assert_eq!(value.attr("URL"), Some(&Value::from("/static")));
        assert_eq!(value.attr("url"), Some(&Value::from("/static")));
        assert_eq!(value.attr("dir"), None);
    }
}
