use std::path::{Component, Path, PathBuf};

/// Raised when a requested path resolves outside its allowed root.
/// Callers must surface this exactly like "not found" so probing requests
/// cannot distinguish a blocked path from a missing one.
#[derive(Debug, PartialEq, Eq)]
pub struct PathViolation;

/// Resolves `requested` against `root` and verifies containment.
///
/// Canonicalization happens on the deepest existing ancestor of the joined
/// path, so symlinks that point outside the root are caught even when the
/// final component does not exist yet. Lexical `..` segments are stripped
/// before touching the filesystem; a request can therefore never climb
/// above `root` regardless of what exists on disk.
pub fn resolve(root: &Path, requested: &Path) -> Result<PathBuf, PathViolation> {
    let root = root.canonicalize().map_err(|_| PathViolation)?;

    // Reject absolute requests and normalize away relative segments.
    let mut clean = PathBuf::new();
    for comp in requested.components() {
        match comp {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(PathViolation);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(PathViolation),
        }
    }

    let joined = root.join(&clean);

    // Canonicalize the deepest existing ancestor to resolve symlinks.
    let mut existing = joined.clone();
    let mut tail = PathBuf::new();
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let resolved = canon.join(&tail);
                if resolved.starts_with(&root) {
                    return Ok(resolved);
                }
                return Err(PathViolation);
            }
            Err(_) => {
                let Some(name) = existing.file_name().map(|n| n.to_owned()) else {
                    return Err(PathViolation);
                };
                let mut rebuilt = PathBuf::from(&name);
                rebuilt.push(&tail);
                tail = rebuilt;
                if !existing.pop() {
                    return Err(PathViolation);
                }
            }
        }
    }
}
