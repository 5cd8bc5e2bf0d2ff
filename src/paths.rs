//! Lexical path helpers shared by the `normpath` filter and the resolver.

use std::path::{Component, Path, PathBuf};

/// Replace a leading `~` with `$HOME`.
pub fn expand_user(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root; `..` at the start of a relative path
/// is kept.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// `~` expansion, absolutization against the working directory, then
/// lexical normalization.
pub fn clean(path: &Path) -> PathBuf {
    let expanded = expand_user(path);
    let absolute = std::path::absolute(&expanded).unwrap_or(expanded);
    normalize(&absolute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("/srv/app/../venv")), PathBuf::from("/srv/venv"));
        assert_eq!(normalize(Path::new("/srv/./app/")), PathBuf::from("/srv/app"));
        assert_eq!(normalize(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("../a/./b")), PathBuf::from("../a/b"));
        assert_eq!(normalize(Path::new("a/..")), PathBuf::from("."));
    }

    #[test]
    fn test_clean_is_absolute() {
        assert!(clean(Path::new("relative/dir")).is_absolute());
        assert_eq!(clean(Path::new("/var//log/./nginx")), PathBuf::from("/var/log/nginx"));
    }
}
