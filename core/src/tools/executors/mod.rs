pub mod diagnostics;
pub mod fs;
pub mod glob;
pub mod grep;
pub mod shell;

pub use diagnostics::*;
pub use fs::*;
pub use glob::*;
pub use grep::*;
pub use shell::*;

use std::ffi::OsStr;
use std::path::{Component, Path};

/// Directory names never searched: dependency caches, build output and
/// editor or version-control metadata
pub const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "dist",
    "build",
    "target",
    ".git",
    ".idea",
    ".vscode",
    "__pycache__",
    "bin",
    "obj",
    "out",
    "coverage",
    "tmp",
    "temp",
    "logs",
    "generated",
    "bower_components",
    "jspm_packages",
];

/// True for dot-prefixed names and the ignored directory names
pub fn is_ignored_name(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    (name.starts_with('.') && name != "." && name != "..") || IGNORED_DIRS.contains(&name.as_ref())
}

/// Apply [`is_ignored_name`] to every component of a path relative to the
/// search root
pub fn is_ignored(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => is_ignored_name(name),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ignored() {
        assert!(is_ignored(Path::new("vendor/lib.go")));
        assert!(is_ignored(Path::new("src/.hidden/a.rs")));
        assert!(is_ignored(Path::new(".env")));
        assert!(is_ignored(Path::new("web/node_modules/x/index.js")));
        assert!(!is_ignored(Path::new("./src/main.rs")));
        assert!(!is_ignored(Path::new("cmd/server/main.go")));
    }
}
