//! Chapter sources: the ordered input of a run.
//!
//! The pipeline only needs a stable, ordered list of `(id, content)` pairs.
//! [`DirectorySource`] produces it from a directory of chapter files named
//! with the `NNN-name` convention (see [`crate::naming`]); any `Vec<Chapter>`
//! is a source too, which is what tests and embedding callers use.
//!
//! ```text
//! chapters/
//! ├── 001-arrival.md          → id "001-arrival"
//! ├── 002-the-road.md         → id "002-the-road"
//! └── 010-part-two/
//!     ├── 001-winter.txt      → id "010-part-two/001-winter"
//!     └── 002-thaw.txt        → id "010-part-two/002-thaw"
//! ```
//!
//! Every chapter carries a SHA-256 fingerprint of its content. Run State
//! stores it so resuming against edited chapter text is refused instead of
//! mixing results from two versions of the book.

use crate::naming::parse_chapter_name;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to walk chapters directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("chapters directory not found: {0}")]
    NotFound(PathBuf),
    #[error("no chapter files found in {0}")]
    NoChapters(PathBuf),
    #[error("duplicate chapter id '{0}'")]
    DuplicateId(String),
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    /// Stable identifier, unique within a run.
    pub id: String,
    pub title: Option<String>,
    pub content: String,
}

impl Chapter {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: content.into(),
        }
    }

    /// SHA-256 of the chapter content as lowercase hex.
    pub fn fingerprint(&self) -> String {
        format!("{:x}", Sha256::digest(self.content.as_bytes()))
    }
}

/// Supplies chapters in document order.
///
/// Must return the same ids in the same order across invocations of a run,
/// otherwise resumption has nothing to line up against.
pub trait ChapterSource {
    fn list(&self) -> Result<Vec<Chapter>, SourceError>;
}

impl ChapterSource for Vec<Chapter> {
    fn list(&self) -> Result<Vec<Chapter>, SourceError> {
        ensure_unique(self)?;
        Ok(self.clone())
    }
}

/// File extensions treated as chapter text.
const CHAPTER_EXTENSIONS: &[&str] = &["md", "txt", "html", "xhtml"];

/// Chapters read from files under a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ChapterSource for DirectorySource {
    fn list(&self) -> Result<Vec<Chapter>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::NotFound(self.root.clone()));
        }

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by(|a, b| sort_name(a).document_order(&sort_name(b)));

        let mut chapters = Vec::new();
        for entry in walker.into_iter().filter_entry(|e| !is_hidden(e)) {
            let entry = entry?;
            if !entry.file_type().is_file() || !has_chapter_extension(entry.path()) {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let id = chapter_id(relative);
            let stem = entry
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = std::fs::read_to_string(entry.path())?;
            chapters.push(Chapter {
                id,
                title: parse_chapter_name(&stem).title(),
                content,
            });
        }

        if chapters.is_empty() {
            return Err(SourceError::NoChapters(self.root.clone()));
        }
        ensure_unique(&chapters)?;
        Ok(chapters)
    }
}

/// Relative path without extension, `/`-separated on every platform.
fn chapter_id(relative: &Path) -> String {
    relative
        .with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn sort_name(entry: &walkdir::DirEntry) -> crate::naming::ChapterName {
    let name = if entry.file_type().is_dir() {
        entry.file_name().to_string_lossy().into_owned()
    } else {
        entry
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    parse_chapter_name(&name)
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn has_chapter_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| CHAPTER_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn ensure_unique(chapters: &[Chapter]) -> Result<(), SourceError> {
    let mut seen = HashSet::new();
    for chapter in chapters {
        if !seen.insert(chapter.id.as_str()) {
            return Err(SourceError::DuplicateId(chapter.id.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn lists_chapters_in_prefix_order() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "010-ten.md", "ten");
        write(tmp.path(), "002-two.md", "two");
        write(tmp.path(), "epilogue.md", "end");
        write(tmp.path(), "001-one.md", "one");

        let chapters = DirectorySource::new(tmp.path()).list().unwrap();
        let ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["001-one", "002-two", "010-ten", "epilogue"]);
        assert_eq!(chapters[0].content, "one");
        assert_eq!(chapters[0].title.as_deref(), Some("one"));
    }

    #[test]
    fn nested_parts_keep_document_order() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "002-part-two/001-a.txt", "a");
        write(tmp.path(), "001-part-one/002-b.txt", "b");
        write(tmp.path(), "001-part-one/001-a.txt", "a");

        let chapters = DirectorySource::new(tmp.path()).list().unwrap();
        let ids: Vec<&str> = chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["001-part-one/001-a", "001-part-one/002-b", "002-part-two/001-a"]
        );
    }

    #[test]
    fn skips_hidden_and_foreign_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "001-one.md", "one");
        write(tmp.path(), ".draft.md", "hidden");
        write(tmp.path(), "cover.jpg", "binary");
        write(tmp.path(), ".cache/001-x.md", "hidden dir");

        let chapters = DirectorySource::new(tmp.path()).list().unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].id, "001-one");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "001-one.md", "a");
        write(tmp.path(), "001-one.txt", "b");

        let err = DirectorySource::new(tmp.path()).list().unwrap_err();
        assert!(matches!(err, SourceError::DuplicateId(id) if id == "001-one"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = DirectorySource::new(tmp.path()).list().unwrap_err();
        assert!(matches!(err, SourceError::NoChapters(_)));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = DirectorySource::new(tmp.path().join("nope")).list().unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = Chapter::new("1", "call me ishmael");
        let b = Chapter::new("2", "call me ishmael");
        let c = Chapter::new("1", "call me later");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn vec_source_rejects_duplicates() {
        let source = vec![Chapter::new("a", "1"), Chapter::new("a", "2")];
        assert!(matches!(source.list(), Err(SourceError::DuplicateId(_))));
    }
}
