//! Path containment and restored-file metadata.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Permission bits a restored file may keep: owner only
pub const RESTORE_MODE_MASK: u32 = 0o700;

/// Canonicalize a path that may not exist yet.
///
/// `.` and `..` are collapsed lexically first, so a `..` can never cancel
/// a component the filesystem has not resolved. The longest existing
/// prefix of the result is then resolved through the filesystem (so
/// symlinks there are followed) and the missing tail is appended as is.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize_lexically(&absolute);

    let components: Vec<Component<'_>> = normalized.components().collect();
    let mut split = components.len();
    let mut base = loop {
        let prefix: PathBuf = components[..split].iter().collect();
        match prefix.canonicalize() {
            Ok(resolved) => break resolved,
            Err(_) if split > 1 => split -= 1,
            Err(e) => return Err(e),
        }
    };

    for component in &components[split..] {
        base.push(component);
    }
    Ok(base)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Resolve `relative` under `root`, refusing anything that escapes it.
///
/// Returns `None` when the canonical result is `root` itself or lies
/// outside it, e.g. `../../etc/passwd`.
pub fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let root = canonicalize_lenient(root).ok()?;
    let trimmed = relative.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let out = canonicalize_lenient(&root.join(trimmed)).ok()?;
    if out.starts_with(&root) && out != root {
        Some(out)
    } else {
        None
    }
}

/// Mask restored permission bits down to the owner
pub fn restore_mode(mode: u32) -> u32 {
    mode & RESTORE_MODE_MASK
}

/// Apply the archived modification time and owner-only permissions
pub fn apply_mode_and_mtime(path: &Path, mode: u32, modified: DateTime<Utc>) -> io::Result<()> {
    // mtime first: the masked mode may leave the file unwritable
    let when: SystemTime = modified.into();
    let file = if path.is_dir() {
        File::open(path)?
    } else {
        File::options().write(true).open(path)?
    };
    file.set_modified(when)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(restore_mode(mode)))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_contained_path() -> io::Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path().join("files");
        fs::create_dir_all(&base)?;
        let canonical = base.canonicalize()?;

        assert_eq!(contained_path(&base, "a/b.txt"), Some(canonical.join("a/b.txt")));
        assert_eq!(contained_path(&base, "/a/./b.txt"), Some(canonical.join("a/b.txt")));
        assert_eq!(contained_path(&base, "a/../b"), Some(canonical.join("b")));
        assert_eq!(contained_path(&base, "../../etc/passwd"), None);
        assert_eq!(contained_path(&base, "a/../../files2/x"), None);
        assert_eq!(contained_path(&base, "."), None);
        assert_eq!(contained_path(&base, ""), None);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_refused() -> io::Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path().join("files");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&outside)?;
        std::os::unix::fs::symlink(&outside, base.join("link"))?;

        assert_eq!(contained_path(&base, "link/secret"), None);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_dotdot_cannot_hide_a_symlink() -> io::Result<()> {
        let temp = TempDir::new()?;
        let base = temp.path().join("files");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&base)?;
        fs::create_dir_all(&outside)?;
        std::os::unix::fs::symlink(&outside, base.join("link"))?;

        assert_eq!(contained_path(&base, "missing/../link/secret"), None);
        assert_eq!(contained_path(&base, "./missing/./../link/x"), None);
        assert_eq!(
            canonicalize_lenient(&base.join("missing/../link/secret"))?,
            outside.canonicalize()?.join("secret")
        );
        Ok(())
    }

    #[test]
    fn test_canonicalize_lenient_missing_tail() -> io::Result<()> {
        let temp = TempDir::new()?;
        let canonical = temp.path().canonicalize()?;
        let resolved = canonicalize_lenient(&temp.path().join("x/y/../z"))?;
        assert_eq!(resolved, canonical.join("x/z"));
        Ok(())
    }

    #[test]
    fn test_restore_mode_mask() {
        assert_eq!(restore_mode(0o4755), 0o700);
        assert_eq!(restore_mode(0o640), 0o600);
        assert_eq!(restore_mode(0o007), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_mode_and_mtime() -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new()?;
        let path = temp.path().join("f");
        fs::write(&path, b"x")?;

        let when = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        apply_mode_and_mtime(&path, 0o666, when)?;

        let meta = fs::metadata(&path)?;
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(DateTime::<Utc>::from(meta.modified()?), when);
        Ok(())
    }
}
