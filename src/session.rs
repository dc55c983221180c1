//! Per-session story directories.
//!
//! Every generation run gets its own directory under the store root:
//! `<root>/<id>/input_images` for uploads and `<root>/<id>/_stories` for the
//! markdown the generator writes. The store root is passed in explicitly;
//! nothing here reads ambient paths.

use crate::collection::{ENTRY_IDENTITY, RawSegment, SegmentCollection};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const INPUT_DIR: &str = "input_images";
const OUTPUT_DIR: &str = "_stories";
const SESSION_ID_LEN: usize = 24;
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

pub const FALLBACK_INDEX: &str = "---
layout: story
title: Adventure
---

# Adventure

An error occurred while generating your adventure. Please try again.

";

#[derive(Debug)]
pub enum SessionError {
    InvalidId(String),
    InvalidFilename(String),
    NotFound(String),
    Io(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidId(id) => write!(f, "invalid session id {id:?}"),
            SessionError::InvalidFilename(name) => write!(f, "invalid filename {name:?}"),
            SessionError::NotFound(what) => write!(f, "{what} not found"),
            SessionError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(value: std::io::Error) -> Self {
        SessionError::Io(value)
    }
}

pub fn generate_session_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Session ids are non-empty and limited to ASCII letters, digits and `-`.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}

fn validate_filename(name: &str) -> Result<(), SessionError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        Err(SessionError::InvalidFilename(name.to_string()))
    } else {
        Ok(())
    }
}

/// `.ext` of an uploaded file name, or empty when it has none worth keeping.
fn upload_extension(original_name: &str) -> String {
    match original_name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

/// Markdown files of `dir`, sorted by name. Unreadable files are skipped
/// and a missing directory reads as empty.
pub fn read_segment_dir(dir: &Path) -> Vec<RawSegment> {
    let mut names = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".md"))
            .collect::<Vec<_>>(),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "failed to read story directory");
            Vec::new()
        }
    };
    names.sort();
    names
        .into_iter()
        .filter_map(|name| match fs::read_to_string(dir.join(&name)) {
            Ok(content) => Some(RawSegment::new(name, content)),
            Err(err) => {
                warn!(dir = %dir.display(), file = %name, error = %err, "skipping unreadable segment");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh session with empty input and output directories.
    pub fn create(&self) -> Result<Session, SessionError> {
        let session = Session::at(&self.root, generate_session_id());
        fs::create_dir_all(session.input_dir())?;
        fs::create_dir_all(session.output_dir())?;
        info!(session = %session.id, dir = %session.dir.display(), "created story session");
        Ok(session)
    }

    /// Opens an existing session. The output directory must exist.
    pub fn open(&self, id: &str) -> Result<Session, SessionError> {
        validate_session_id(id)?;
        let session = Session::at(&self.root, id.to_string());
        if !session.dir.is_dir() || !session.output_dir().is_dir() {
            return Err(SessionError::NotFound(format!("session {id}")));
        }
        Ok(session)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    dir: PathBuf,
}

impl Session {
    fn at(root: &Path, id: String) -> Self {
        let dir = root.join(&id);
        Self { id, dir }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join(INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join(OUTPUT_DIR)
    }

    /// Stores an upload as `image_<position + 1><ext>`.
    pub fn save_image(
        &self,
        position: usize,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, SessionError> {
        let filename = format!("image_{}{}", position + 1, upload_extension(original_name));
        let path = self.input_dir().join(filename);
        fs::write(&path, bytes)?;
        debug!(session = %self.id, path = %path.display(), bytes = bytes.len(), "saved uploaded image");
        Ok(path)
    }

    /// Markdown files of the output directory; see [`read_segment_dir`].
    pub fn read_segments(&self) -> Vec<RawSegment> {
        read_segment_dir(&self.output_dir())
    }

    pub fn load_collection(&self) -> SegmentCollection {
        SegmentCollection::build(&self.read_segments())
    }

    /// Uploaded images (jpg, jpeg, png, webp), sorted by name.
    pub fn image_files(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.input_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<_> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| {
                name.rsplit_once('.')
                    .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext))
            })
            .collect();
        names.sort();
        names
    }

    /// Path of an uploaded image. Rejects names that could leave the
    /// input directory.
    pub fn image_path(&self, filename: &str) -> Result<PathBuf, SessionError> {
        validate_filename(filename)?;
        let path = self.input_dir().join(filename);
        if path.is_file() {
            Ok(path)
        } else {
            Err(SessionError::NotFound(format!("image {filename}")))
        }
    }

    /// Writes the stand-in `index.md` used when generation produced nothing.
    pub fn write_fallback_index(&self) -> Result<RawSegment, SessionError> {
        fs::create_dir_all(self.output_dir())?;
        fs::write(self.output_dir().join(ENTRY_IDENTITY), FALLBACK_INDEX)?;
        warn!(session = %self.id, "no story files generated, wrote fallback index");
        Ok(RawSegment::new(ENTRY_IDENTITY, FALLBACK_INDEX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn session_ids_validate() {
        assert!(validate_session_id(&generate_session_id()).is_ok());
        assert!(validate_session_id("abc-123").is_ok());
        for bad in ["", "../etc", "a b", "a/b", "ä"] {
            assert!(validate_session_id(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn upload_extensions_are_sanitised() {
        assert_eq!(upload_extension("photo.JPG"), ".jpg");
        assert_eq!(upload_extension("noext"), "");
        assert_eq!(upload_extension("evil.png/../../x"), "");
        assert_eq!(upload_extension("trailing."), "");
    }

    #[test]
    fn create_then_open_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let session = store.create().unwrap();
        assert!(session.input_dir().is_dir());
        let reopened = store.open(session.id()).unwrap();
        assert_eq!(reopened.id(), session.id());
        assert!(matches!(store.open("missing"), Err(SessionError::NotFound(_))));
        assert!(matches!(store.open("../x"), Err(SessionError::InvalidId(_))));
    }

    #[test]
    fn reads_only_markdown_in_name_order() {
        let dir = TempDir::new().unwrap();
        let session = SessionStore::new(dir.path()).create().unwrap();
        fs::write(session.output_dir().join("b.md"), "B").unwrap();
        fs::write(session.output_dir().join("a.md"), "A").unwrap();
        fs::write(session.output_dir().join("test.txt"), "ignored").unwrap();
        let names: Vec<_> = session
            .read_segments()
            .into_iter()
            .map(|seg| seg.identity)
            .collect();
        assert_eq!(names, ["a.md", "b.md"]);
    }

    #[test]
    fn images_are_saved_listed_and_guarded() {
        let dir = TempDir::new().unwrap();
        let session = SessionStore::new(dir.path()).create().unwrap();
        session.save_image(0, "cat.png", b"png").unwrap();
        session.save_image(1, "dog.webp", b"webp").unwrap();
        session.save_image(2, "notes.txt", b"txt").unwrap();
        assert_eq!(session.image_files(), ["image_1.png", "image_2.webp"]);
        assert!(session.image_path("image_1.png").is_ok());
        assert!(matches!(session.image_path("../x.png"), Err(SessionError::InvalidFilename(_))));
        assert!(matches!(session.image_path("nope.png"), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn fallback_index_loads_as_entry() {
        let dir = TempDir::new().unwrap();
        let session = SessionStore::new(dir.path()).create().unwrap();
        session.write_fallback_index().unwrap();
        let collection = session.load_collection();
        assert_eq!(collection.entry().title, "Adventure");
        assert!(collection.entry().body.contains("An error occurred"));
    }
}
