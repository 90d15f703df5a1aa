//! Local filesystem helpers.

use crate::errors::ExpflowResult;
use std::path::Path;
use walkdir::WalkDir;

/// Places `src` at `dst`, hard-linking files when possible and copying otherwise.
///
/// Directories are mirrored entry by entry. An existing `dst` is replaced.
pub fn link_or_copy(src: &Path, dst: &Path) -> ExpflowResult<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    remove_path(dst)?;
    if src.is_dir() {
        for item in WalkDir::new(src) {
            let item = item?;
            let relative = item.path().strip_prefix(src).unwrap_or(item.path());
            let target = dst.join(relative);
            if item.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                link_or_copy_file(item.path(), &target)?;
            }
        }
        Ok(())
    } else {
        link_or_copy_file(src, dst)
    }
}

fn link_or_copy_file(src: &Path, dst: &Path) -> ExpflowResult<()> {
    if std::fs::hard_link(src, dst).is_err() {
        // cross-device or unsupported filesystem
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

/// Removes a file or directory tree if present.
pub fn remove_path(path: &Path) -> ExpflowResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Returns true for an existing, non-empty directory or an existing file.
#[must_use]
pub fn has_content(path: &Path) -> bool {
    if path.is_dir() {
        std::fs::read_dir(path).is_ok_and(|mut it| it.next().is_some())
    } else {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_or_copy_file_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("x")).unwrap();
        std::fs::write(src.join("x/f.txt"), "hello").unwrap();

        let dst = dir.path().join("cache/entry");
        link_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("x/f.txt")).unwrap(), "hello");

        // replacing an existing target
        let file = dir.path().join("one.txt");
        std::fs::write(&file, "1").unwrap();
        link_or_copy(&file, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "1");
    }

    #[test]
    fn test_has_content() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_content(dir.path()));
        assert!(!has_content(&dir.path().join("missing")));
        std::fs::write(dir.path().join("f"), "").unwrap();
        assert!(has_content(dir.path()));
        assert!(has_content(&dir.path().join("f")));
    }
}
