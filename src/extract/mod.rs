//! # Extraction
//!
//! Archive unpacking, installer decompilation, and install-script analysis.

pub mod archive;
pub mod installer;
pub mod script;

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub use archive::extract_archive;
pub use installer::{InstallerDecompiler, InstallerOutput, locate_installer};
pub use script::{ComponentSelector, CustomAction, MaliciousComponent, find_malicious_component};

/// Recursively collect regular files under `dir` whose extension matches
/// `extension` (case-insensitive), sorted by path.
pub fn find_files_by_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let wanted = extension.trim_start_matches('.');
    let mut out: Vec<PathBuf> = walk_files(dir)
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
        })
        .collect();
    out.sort();
    out
}

/// Every regular file under `dir`, sorted by path. Unreadable entries are
/// skipped.
pub fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    out.sort();
    out
}

/// Copy `source` into `dest_dir`, keeping the file name.
pub fn copy_into(source: &Path, dest_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let name = source
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "source has no file name"))?;
    let dest = dest_dir.join(name);
    std::fs::copy(source, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_files_by_extension_recursively() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("nested/deeper")).expect("dirs");
        std::fs::write(dir.path().join("a.MSI"), b"x").expect("write");
        std::fs::write(dir.path().join("nested/deeper/b.msi"), b"x").expect("write");
        std::fs::write(dir.path().join("nested/readme.txt"), b"x").expect("write");

        let found = find_files_by_extension(dir.path(), "msi");
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("a.MSI"));
        assert!(found[1].ends_with("nested/deeper/b.msi"));
    }

    #[test]
    fn walk_lists_only_files_in_path_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("b/empty")).expect("dirs");
        std::fs::write(dir.path().join("b/two.bin"), b"x").expect("write");
        std::fs::write(dir.path().join("a.bin"), b"x").expect("write");
        std::fs::write(dir.path().join("c.bin"), b"x").expect("write");

        let files = walk_files(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).expect("prefix").to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.bin"),
                PathBuf::from("b/two.bin"),
                PathBuf::from("c.bin")
            ]
        );
    }

    #[test]
    fn copy_into_keeps_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("payload.dll");
        std::fs::write(&src, b"MZ").expect("write");
        let dest = copy_into(&src, &dir.path().join("out")).expect("copy");
        assert!(dest.ends_with("out/payload.dll"));
        assert_eq!(std::fs::read(dest).expect("read"), b"MZ");
    }
}
