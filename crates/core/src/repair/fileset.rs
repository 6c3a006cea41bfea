use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::types::{FilePatch, RepairContext};

/// Directories never loaded into a file set.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "dist"];

/// Files larger than this are left out when loading from disk.
const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Why a patch set could not be applied. Nothing is written when any patch
/// in the set is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("empty patch set")]
    EmptyPatchSet,
    #[error("patch targets a file outside the repair context: {0}")]
    OutsideContext(String),
    #[error("patch set touches {0} more than once")]
    DuplicatePath(String),
    #[error("{0} changed after the repair context was taken")]
    ConcurrentEdit(String),
    #[error("{path} does not parse: {detail}")]
    InvalidSyntax { path: String, detail: String },
}

#[derive(Debug, Clone)]
struct Entry {
    content: String,
    revision: u64,
}

/// The hosted project's source files, keyed by relative path.
///
/// Each file carries a revision that moves on every write, so patches
/// generated from an older snapshot can be detected and refused.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: BTreeMap<String, Entry>,
    active: Option<String>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (path, content) in files {
            set.insert(path, content);
        }
        set
    }

    /// Write a file outside of any repair (editor save, operator change).
    /// Returns the new revision.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) -> u64 {
        let content = content.into();
        let entry = self.files.entry(path.into()).or_insert(Entry {
            content: String::new(),
            revision: 0,
        });
        entry.content = content;
        entry.revision += 1;
        entry.revision
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(|e| e.content.as_str())
    }

    pub fn revision(&self, path: &str) -> Option<u64> {
        self.files.get(path).map(|e| e.revision)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Mark the file currently open in the editor. Unknown paths are ignored.
    pub fn set_active(&mut self, path: &str) -> bool {
        let known = self.files.contains_key(path);
        if known {
            self.active = Some(path.to_string());
        }
        known
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Copy of the current contents for the patch generator.
    pub fn snapshot(&self) -> RepairContext {
        RepairContext {
            files: self
                .files
                .iter()
                .map(|(p, e)| (p.clone(), e.content.clone()))
                .collect(),
            active_file: self.active.clone(),
            last_operation: None,
            prior_failures: Vec::new(),
            revisions: self.files.iter().map(|(p, e)| (p.clone(), e.revision)).collect(),
        }
    }

    /// Apply a whole patch set or nothing. `base` holds the revisions the
    /// patches were generated against. Returns the rewritten paths.
    pub fn apply(
        &mut self,
        patches: &[FilePatch],
        base: &BTreeMap<String, u64>,
    ) -> Result<Vec<String>, ApplyError> {
        if patches.is_empty() {
            return Err(ApplyError::EmptyPatchSet);
        }

        let mut seen = BTreeSet::new();
        for patch in patches {
            let path = patch.path.as_str();
            let (Some(current), Some(expected)) = (self.files.get(path), base.get(path)) else {
                return Err(ApplyError::OutsideContext(patch.path.clone()));
            };
            if !seen.insert(path) {
                return Err(ApplyError::DuplicatePath(patch.path.clone()));
            }
            if current.revision != *expected {
                return Err(ApplyError::ConcurrentEdit(patch.path.clone()));
            }
            check_syntax(path, &patch.new_content)?;
        }

        let mut written = Vec::with_capacity(patches.len());
        for patch in patches {
            if let Some(entry) = self.files.get_mut(&patch.path) {
                entry.content.clone_from(&patch.new_content);
                entry.revision += 1;
                written.push(patch.path.clone());
            }
        }
        Ok(written)
    }

    /// Load every UTF-8 text file under `root`, skipping hidden entries and
    /// build output directories.
    pub fn load_dir(root: &Path) -> io::Result<Self> {
        let mut set = Self::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !(e.file_type().is_dir() && SKIPPED_DIRS.contains(&&*name))
        });

        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map_err(io::Error::other)?.len() > MAX_FILE_BYTES {
                tracing::debug!(path = %entry.path().display(), "skipping oversized file");
                continue;
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => continue,
                Err(e) => return Err(e),
            };
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            set.insert(rel, content);
        }
        Ok(set)
    }

    /// Persist the given paths back under `root`.
    pub fn write_dir(&self, root: &Path, paths: &[String]) -> io::Result<()> {
        for path in paths {
            let Some(content) = self.get(path) else {
                continue;
            };
            let target = root.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}

/// Reject content that cannot be right for its file type.
fn check_syntax(path: &str, content: &str) -> Result<(), ApplyError> {
    let detail = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("rs") => syn::parse_file(content).err().map(|e| e.to_string()),
        Some("json") => serde_json::from_str::<serde_json::Value>(content)
            .err()
            .map(|e| e.to_string()),
        _ => None,
    };
    match detail {
        Some(detail) => Err(ApplyError::InvalidSyntax {
            path: path.to_string(),
            detail,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(path: &str, content: &str) -> FilePatch {
        FilePatch {
            path: path.into(),
            new_content: content.into(),
        }
    }

    fn project() -> FileSet {
        FileSet::from_files([
            ("src/app.js", "render(a.b)"),
            ("src/lib.rs", "pub fn f() {}"),
            ("package.json", "{}"),
        ])
    }

    #[test]
    fn applies_against_fresh_snapshot() {
        let mut fs = project();
        let ctx = fs.snapshot();
        let written = fs
            .apply(&[patch("src/app.js", "render(a?.b)")], &ctx.revisions)
            .unwrap();
        assert_eq!(written, vec!["src/app.js".to_string()]);
        assert_eq!(fs.get("src/app.js"), Some("render(a?.b)"));
        assert_eq!(fs.revision("src/app.js"), Some(2));
    }

    #[test]
    fn rejects_without_writing_anything() {
        let mut fs = project();
        let ctx = fs.snapshot();
        let err = fs
            .apply(
                &[patch("src/app.js", "ok()"), patch("src/other.js", "x")],
                &ctx.revisions,
            )
            .unwrap_err();
        assert_eq!(err, ApplyError::OutsideContext("src/other.js".into()));
        assert_eq!(fs.get("src/app.js"), Some("render(a.b)"));

        assert_eq!(fs.apply(&[], &ctx.revisions), Err(ApplyError::EmptyPatchSet));
        assert_eq!(
            fs.apply(&[patch("src/app.js", "1"), patch("src/app.js", "2")], &ctx.revisions),
            Err(ApplyError::DuplicatePath("src/app.js".into()))
        );
    }

    #[test]
    fn detects_edits_since_snapshot() {
        let mut fs = project();
        let ctx = fs.snapshot();
        fs.insert("src/app.js", "user edit");
        let err = fs
            .apply(&[patch("src/app.js", "patched")], &ctx.revisions)
            .unwrap_err();
        assert_eq!(err, ApplyError::ConcurrentEdit("src/app.js".into()));
        assert_eq!(fs.get("src/app.js"), Some("user edit"));
    }

    #[test]
    fn syntax_checked_for_rust_and_json() {
        let mut fs = project();
        let ctx = fs.snapshot();
        let err = fs
            .apply(&[patch("src/lib.rs", "pub fn f( {")], &ctx.revisions)
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidSyntax { ref path, .. } if path == "src/lib.rs"));
        let err = fs
            .apply(&[patch("package.json", "{ nope")], &ctx.revisions)
            .unwrap_err();
        assert!(matches!(err, ApplyError::InvalidSyntax { .. }));
    }

    #[test]
    fn load_and_write_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("src/app.js"), "a()").unwrap();
        std::fs::write(root.join("node_modules/x/index.js"), "x").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(root.join("logo.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let mut fs = FileSet::load_dir(root).unwrap();
        assert_eq!(fs.paths().collect::<Vec<_>>(), vec!["src/app.js"]);

        let ctx = fs.snapshot();
        let written = fs.apply(&[patch("src/app.js", "b()")], &ctx.revisions).unwrap();
        fs.write_dir(root, &written).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("src/app.js")).unwrap(), "b()");
    }

    #[test]
    fn active_file_must_exist() {
        let mut fs = project();
        assert!(!fs.set_active("missing.js"));
        assert_eq!(fs.active(), None);
        assert!(fs.set_active("src/app.js"));
        assert_eq!(fs.snapshot().active_file.as_deref(), Some("src/app.js"));
    }
}
