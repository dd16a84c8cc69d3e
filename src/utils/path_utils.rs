use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

/// Lexically removes `.` and `..` without touching the filesystem.
fn collapse_components(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => components.push(component),
            },
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

/// Resolves a model-supplied path against the workspace root.
///
/// Relative paths are joined onto `files_root`; existing paths are
/// canonicalised with dunce so Windows results stay free of `\\?\` prefixes.
pub fn resolve_path(path_str: &str, files_root: &Path) -> Result<PathBuf, AppError> {
    let trimmed = path_str.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidPath("Path is empty".to_string()));
    }
    let expanded = expand_tilde_path_buf(trimmed);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        files_root.join(expanded)
    };
    let collapsed = collapse_components(&joined);
    let resolved = dunce::canonicalize(&collapsed).unwrap_or(collapsed);
    debug!(input = %path_str, resolved = %resolved.display(), "Resolved path");
    Ok(resolved)
}

/// Path shown back to the model: relative to the workspace when inside it.
pub fn display_relative(path: &Path, files_root: &Path) -> String {
    let root = dunce::canonicalize(files_root).unwrap_or_else(|_| files_root.to_path_buf());
    match path.strip_prefix(&root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().replace('\\', "/"),
        Ok(_) => ".".to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn relative_paths_join_the_root() {
        let dir = TempDir::new().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(root.join("src")).unwrap();
        let resolved = resolve_path("./src/../src/main.rs", &root).unwrap();
        assert_eq!(resolved, root.join("src").join("main.rs"));
        assert_eq!(display_relative(&resolved, &root), "src/main.rs");
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(matches!(resolve_path("  ", Path::new("/tmp")), Err(AppError::InvalidPath(_))));
    }

    #[test]
    fn tilde_expands_to_home() {
        let resolved = expand_tilde_path_buf("~/x");
        assert!(!resolved.to_string_lossy().starts_with('~'));
    }
}
