//! Raw and processed image corpus: one directory per person under each root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of every processed face crop.
pub const PROCESSED_EXTENSION: &str = "png";

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("invalid person name {0:?}")]
    InvalidName(String),
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CorpusError + '_ {
    move |source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Check that a display name can be used as a directory name.
///
/// Returns the trimmed name.
pub fn validate_name(name: &str) -> Result<&str, CorpusError> {
    let trimmed = name.trim();
    let bad = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.starts_with('.')
        || trimmed.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(CorpusError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}

/// File extension for an uploaded image, inferred from its bytes.
///
/// Unrecognized data keeps a `jpg` extension and is skipped later when it
/// fails to decode.
pub fn image_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("jpg")
}

#[derive(Debug, Clone)]
pub struct CorpusLayout {
    raw_root: PathBuf,
    processed_root: PathBuf,
}

impl CorpusLayout {
    pub fn new(raw_root: impl Into<PathBuf>, processed_root: impl Into<PathBuf>) -> Self {
        Self {
            raw_root: raw_root.into(),
            processed_root: processed_root.into(),
        }
    }

    /// Create both roots if missing.
    pub fn ensure_roots(&self) -> Result<(), CorpusError> {
        fs::create_dir_all(&self.raw_root).map_err(io_err(&self.raw_root))?;
        fs::create_dir_all(&self.processed_root).map_err(io_err(&self.processed_root))?;
        Ok(())
    }

    pub fn raw_root(&self) -> &Path {
        &self.raw_root
    }

    pub fn processed_root(&self) -> &Path {
        &self.processed_root
    }

    pub fn raw_dir(&self, name: &str) -> PathBuf {
        self.raw_root.join(name)
    }

    pub fn processed_dir(&self, name: &str) -> PathBuf {
        self.processed_root.join(name)
    }

    /// Store one upload as `<person_id>_<index>.<ext>` in the person's raw directory.
    pub fn save_raw(
        &self,
        name: &str,
        person_id: &str,
        index: usize,
        bytes: &[u8],
    ) -> Result<PathBuf, CorpusError> {
        let dir = self.raw_dir(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(format!("{person_id}_{index}.{}", image_extension(bytes)));
        fs::write(&path, bytes).map_err(io_err(&path))?;
        Ok(path)
    }

    /// Processed output for a raw image: `<processed>/<name>/<stem>.png`.
    pub fn processed_path_for(&self, name: &str, raw: &Path) -> PathBuf {
        let stem = raw
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.processed_dir(name)
            .join(format!("{stem}.{PROCESSED_EXTENSION}"))
    }

    /// Person directories in the processed corpus that hold at least one
    /// file, sorted.
    pub fn list_people(&self) -> Result<Vec<String>, CorpusError> {
        if !self.processed_root.exists() {
            return Ok(Vec::new());
        }
        let mut people = Vec::new();
        for entry in fs::read_dir(&self.processed_root).map_err(io_err(&self.processed_root))? {
            let entry = entry.map_err(io_err(&self.processed_root))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !entry.file_type().map_err(io_err(&path))?.is_dir() {
                continue;
            }
            if list_files(&path)?.is_empty() {
                tracing::debug!(person = %name, "empty processed directory ignored");
                continue;
            }
            people.push(name);
        }
        people.sort();
        Ok(people)
    }

    pub fn raw_images(&self, name: &str) -> Result<Vec<PathBuf>, CorpusError> {
        list_files(&self.raw_dir(name))
    }

    pub fn processed_images(&self, name: &str) -> Result<Vec<PathBuf>, CorpusError> {
        list_files(&self.processed_dir(name))
    }

    /// Delete the raw and processed files produced by one registration.
    pub fn remove_registration_files(&self, name: &str, person_id: &str) -> Result<usize, CorpusError> {
        let prefix = format!("{person_id}_");
        let mut removed = 0;
        for dir in [self.raw_dir(name), self.processed_dir(name)] {
            for path in list_files(&dir)? {
                let matches = path
                    .file_name()
                    .map(|f| f.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false);
                if matches {
                    fs::remove_file(&path).map_err(io_err(&path))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Remove a person's raw and processed directories entirely.
    pub fn remove_person(&self, name: &str) -> Result<(), CorpusError> {
        for dir in [self.raw_dir(name), self.processed_dir(name)] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&dir)(e)),
            }
        }
        Ok(())
    }

    /// Remove the person's processed directory if it holds no images.
    pub fn prune_empty_processed(&self, name: &str) -> Result<bool, CorpusError> {
        let dir = self.processed_dir(name);
        if dir.is_dir() && list_files(&dir)?.is_empty() {
            fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Regular, non-hidden files in `dir`, sorted. A missing directory is empty.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().map_err(io_err(&entry.path()))?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn layout(dir: &Path) -> CorpusLayout {
        CorpusLayout::new(dir.join("raw"), dir.join("processed"))
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  Alice ").unwrap(), "Alice");
        assert_eq!(validate_name("Jean-Luc Picard").unwrap(), "Jean-Luc Picard");
        for bad in ["", "   ", ".", "..", "a/b", "a\\b", ".hidden", "tab\there"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_image_extension() {
        assert_eq!(image_extension(&png_bytes()), "png");
        assert_eq!(image_extension(b"definitely not an image"), "jpg");
    }

    #[test]
    fn test_save_raw_naming() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = layout(dir.path());
        let path = corpus.save_raw("Alice", "abc", 2, &png_bytes()).unwrap();
        assert_eq!(path, dir.path().join("raw/Alice/abc_2.png"));
        assert!(path.exists());
        assert_eq!(
            corpus.processed_path_for("Alice", &path),
            dir.path().join("processed/Alice/abc_2.png")
        );
    }

    #[test]
    fn test_list_people_sorted_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = layout(dir.path());
        corpus.ensure_roots().unwrap();
        for name in ["Zed", "Alice", "Mike", ".cache"] {
            fs::create_dir_all(corpus.processed_dir(name)).unwrap();
            fs::write(corpus.processed_dir(name).join("x_0.png"), png_bytes()).unwrap();
        }
        fs::write(corpus.processed_root().join("stray.txt"), b"x").unwrap();

        assert_eq!(corpus.list_people().unwrap(), vec!["Alice", "Mike", "Zed"]);
    }

    #[test]
    fn test_list_people_skips_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = layout(dir.path());
        fs::create_dir_all(corpus.processed_dir("Alice")).unwrap();
        fs::write(corpus.processed_dir("Alice").join("a_0.png"), png_bytes()).unwrap();
        fs::create_dir_all(corpus.processed_dir("Bob")).unwrap();
        // Only hidden leftovers, e.g. an interrupted tmp write.
        fs::create_dir_all(corpus.processed_dir("Carol")).unwrap();
        fs::write(corpus.processed_dir("Carol").join(".c_0.png.tmp"), b"partial").unwrap();

        assert_eq!(corpus.list_people().unwrap(), vec!["Alice"]);
    }

    #[test]
    fn test_list_people_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(layout(&dir.path().join("nope")).list_people().unwrap().is_empty());
    }

    #[test]
    fn test_remove_registration_files_only_touches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = layout(dir.path());
        let bytes = png_bytes();
        corpus.save_raw("Alice", "one", 0, &bytes).unwrap();
        corpus.save_raw("Alice", "one", 1, &bytes).unwrap();
        corpus.save_raw("Alice", "two", 0, &bytes).unwrap();
        fs::create_dir_all(corpus.processed_dir("Alice")).unwrap();
        fs::write(corpus.processed_dir("Alice").join("one_0.png"), &bytes).unwrap();
        fs::write(corpus.processed_dir("Alice").join("two_0.png"), &bytes).unwrap();

        assert_eq!(corpus.remove_registration_files("Alice", "one").unwrap(), 3);
        let raw: Vec<_> = corpus
            .raw_images("Alice")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(raw, vec!["two_0.png"]);
        assert_eq!(corpus.processed_images("Alice").unwrap().len(), 1);
    }

    #[test]
    fn test_remove_person_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = layout(dir.path());
        corpus.save_raw("Bob", "x", 0, &png_bytes()).unwrap();
        fs::create_dir_all(corpus.processed_dir("Bob")).unwrap();

        assert!(corpus.prune_empty_processed("Bob").unwrap());
        assert!(!corpus.processed_dir("Bob").exists());

        corpus.remove_person("Bob").unwrap();
        assert!(!corpus.raw_dir("Bob").exists());
        // Second removal is a no-op.
        corpus.remove_person("Bob").unwrap();
    }
}
