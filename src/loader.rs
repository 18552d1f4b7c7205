//! Document loading: file type detection, size limits, encoding
//! normalisation, and dispatch to the format extractors.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::chunk::sha256_hex;
use crate::config::IngestConfig;
use crate::extract::{self, ExtractError};
use crate::models::FailureKind;

/// Recognised input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Pdf,
    Markdown,
    Text,
    Rst,
    Doc,
    Docx,
    Html,
}

impl DocumentKind {
    /// Detect the kind from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "md" => Some(Self::Markdown),
            "txt" => Some(Self::Text),
            "rst" => Some(Self::Rst),
            "doc" => Some(Self::Doc),
            "docx" => Some(Self::Docx),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Rst => "rst",
            Self::Doc => "doc",
            Self::Docx => "docx",
            Self::Html => "html",
        }
    }
}

pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "md", "txt", "rst", "doc", "docx", "html", "htm"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("cannot read {}: {reason}", path.display())]
    ReadError { path: PathBuf, reason: String },
    #[error("{} is {size} bytes, above the {limit} byte limit", path.display())]
    SizeExceeded { path: PathBuf, size: u64, limit: u64 },
}

impl LoadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LoadError::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            LoadError::ReadError { .. } => FailureKind::ReadError,
            LoadError::SizeExceeded { .. } => FailureKind::SizeExceeded,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            LoadError::UnsupportedFormat(path)
            | LoadError::ReadError { path, .. }
            | LoadError::SizeExceeded { path, .. } => path,
        }
    }
}

/// A document extracted from disk, alive only during ingestion.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Canonical path when the file could be canonicalised.
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub text: String,
    pub modified: DateTime<Utc>,
    pub extracted_at: DateTime<Utc>,
    /// SHA-256 of the extracted text.
    pub content_hash: String,
}

impl LoadedDocument {
    /// Registry key for this document.
    pub fn source_key(&self) -> String {
        source_key(&self.path)
    }
}

/// Registry key for a path.
///
/// The same file yields the same key whether it is named relatively or
/// absolutely, and whether or not it still exists on disk.
pub fn source_key(path: &Path) -> String {
    resolve_path(path).to_string_lossy().to_string()
}

/// Canonical form of `path`. For a path that no longer exists the deepest
/// existing ancestor is canonicalised and the missing tail appended.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    let mut tail = Vec::new();
    let mut cursor = absolute.as_path();
    while let (Some(parent), Some(name)) = (cursor.parent(), cursor.file_name()) {
        tail.push(name);
        if let Ok(mut base) = std::fs::canonicalize(parent) {
            base.extend(tail.iter().rev());
            return base;
        }
        cursor = parent;
    }
    absolute
}

#[derive(Debug, Clone)]
pub struct DocumentLoader {
    max_file_size: u64,
    auto_detect_encoding: bool,
}

impl DocumentLoader {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            auto_detect_encoding: config.auto_detect_encoding,
        }
    }

    /// Load and extract one file.
    ///
    /// Checks run cheapest first: extension, metadata, size, then the read
    /// and extraction itself.
    pub fn load(&self, path: &Path) -> Result<LoadedDocument, LoadError> {
        let kind = DocumentKind::from_path(path)
            .ok_or_else(|| LoadError::UnsupportedFormat(path.to_path_buf()))?;

        let read_err = |reason: String| LoadError::ReadError {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = std::fs::metadata(path).map_err(|e| read_err(e.to_string()))?;
        if !metadata.is_file() {
            return Err(read_err("not a regular file".to_string()));
        }
        if metadata.len() > self.max_file_size {
            return Err(LoadError::SizeExceeded {
                path: path.to_path_buf(),
                size: metadata.len(),
                limit: self.max_file_size,
            });
        }

        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let bytes = std::fs::read(path).map_err(|e| read_err(e.to_string()))?;

        let text = match kind {
            DocumentKind::Markdown | DocumentKind::Text | DocumentKind::Rst => {
                decode_text(&bytes, self.auto_detect_encoding)
            }
            DocumentKind::Html => {
                extract::html_to_text(&decode_text(&bytes, self.auto_detect_encoding))
            }
            DocumentKind::Pdf | DocumentKind::Docx | DocumentKind::Doc => {
                extract::extract_binary(&bytes, kind)
                    .map_err(|e: ExtractError| read_err(e.to_string()))?
            }
        };
        let text = normalize_newlines(&text);

        debug!(
            path = %path.display(),
            kind = kind.as_str(),
            bytes = bytes.len(),
            chars = text.chars().count(),
            "extracted document"
        );

        Ok(LoadedDocument {
            path: resolve_path(path),
            kind,
            content_hash: sha256_hex(text.as_bytes()),
            text,
            modified,
            extracted_at: Utc::now(),
        })
    }
}

/// Decode bytes of unknown encoding into a `String`.
///
/// A byte-order mark wins; valid UTF-8 is taken as-is; anything else is
/// run through charset detection (GBK, GB18030, Big5, Windows-125x, …) when
/// `auto_detect` is set, or decoded lossily as UTF-8 otherwise.
pub fn decode_text(bytes: &[u8], auto_detect: bool) -> String {
    if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    if !auto_detect {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!(encoding = encoding.name(), "decoded with replacement characters");
    }
    text.into_owned()
}

fn normalize_newlines(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.to_string()
    }
}

/// Files found by [`collect_documents`], plus the entries that could not be
/// walked.
#[derive(Debug, Default)]
pub struct Collected {
    pub files: Vec<PathBuf>,
    /// Always [`LoadError::ReadError`].
    pub errors: Vec<LoadError>,
}

/// Expand the given paths into a sorted list of files.
///
/// Directories are walked recursively and only files with a supported
/// extension are kept; explicitly named files are always kept so that an
/// unsupported or missing file still surfaces as a per-file failure.
/// Unreadable directories and entries are returned as errors, not skipped.
pub fn collect_documents(paths: &[PathBuf]) -> Collected {
    let mut out = Collected::default();
    for path in paths {
        if !path.is_dir() {
            out.files.push(path.clone());
            continue;
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(path).follow_links(false) {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file()
                        && DocumentKind::from_path(entry.path()).is_some()
                    {
                        found.push(entry.into_path());
                    }
                }
                Err(e) => {
                    let failed_path = e.path().unwrap_or(path).to_path_buf();
                    debug!(path = %failed_path.display(), "walk error: {}", e);
                    out.errors.push(LoadError::ReadError {
                        path: failed_path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        found.sort();
        out.files.extend(found);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn loader(max: u64) -> DocumentLoader {
        DocumentLoader::new(&IngestConfig {
            max_file_size: max,
            auto_detect_encoding: true,
        })
    }

    #[test]
    fn detects_kinds_case_insensitively() {
        assert_eq!(DocumentKind::from_path(Path::new("a.PDF")), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_path(Path::new("a.htm")), Some(DocumentKind::Html));
        assert_eq!(DocumentKind::from_path(Path::new("a.rst")), Some(DocumentKind::Rst));
        assert_eq!(DocumentKind::from_path(Path::new("a.xlsx")), None);
        assert_eq!(DocumentKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn unsupported_extension_checked_before_existence() {
        let err = loader(1024).load(Path::new("/nonexistent/file.exe")).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = loader(1024).load(Path::new("/nonexistent/file.txt")).unwrap_err();
        assert!(matches!(err, LoadError::ReadError { .. }));
    }

    #[test]
    fn oversized_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big.txt");
        fs::write(&path, "x".repeat(2048)).unwrap();
        let err = loader(1024).load(&path).unwrap_err();
        assert!(matches!(err, LoadError::SizeExceeded { size: 2048, limit: 1024, .. }));
    }

    #[test]
    fn loads_text_and_normalizes_newlines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.md");
        fs::write(&path, "# Title\r\n\r\nBody line\r\n").unwrap();
        let doc = loader(1024).load(&path).unwrap();
        assert_eq!(doc.kind, DocumentKind::Markdown);
        assert_eq!(doc.text, "# Title\n\nBody line\n");
        assert_eq!(doc.content_hash.len(), 64);
    }

    #[test]
    fn decodes_gbk_text() {
        let original = "银河麒麟操作系统用户手册，包含安装和配置说明。\
                        本手册介绍系统的基本使用方法、软件包管理以及常见问题的处理办法。\
                        如果遇到网络连接问题，请先检查网络设置，然后重新启动网络服务。";
        let (bytes, _, _) = encoding_rs::GBK.encode(original);
        assert!(std::str::from_utf8(&bytes).is_err());
        let text = decode_text(&bytes, true);
        assert_eq!(text, original);
    }

    #[test]
    fn decodes_utf16_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hello 麒麟".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&bytes, false), "hello 麒麟");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFabc", true), "abc");
    }

    #[test]
    fn html_is_converted_to_text() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("page.html");
        fs::write(&path, "<html><body><p>Hello &amp; welcome</p></body></html>").unwrap();
        let doc = loader(1024).load(&path).unwrap();
        assert_eq!(doc.text.trim(), "Hello & welcome");
    }

    #[test]
    fn collect_documents_walks_directories() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir_all(&sub).unwrap();
        fs::write(tmp.path().join("b.txt"), "b").unwrap();
        fs::write(sub.join("a.md"), "a").unwrap();
        fs::write(tmp.path().join("skip.bin"), "x").unwrap();

        let explicit = tmp.path().join("explicit.bin");
        let collected = collect_documents(&[tmp.path().to_path_buf(), explicit.clone()]);
        assert!(collected.errors.is_empty());
        let found = collected.files;
        assert_eq!(found.len(), 3);
        assert!(found.iter().any(|p| p.ends_with("b.txt")));
        assert!(found.iter().any(|p| p.ends_with("sub/a.md")));
        assert_eq!(found.last().unwrap(), &explicit);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("ok.txt"), "fine").unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("hidden.txt"), "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // permission bits do not apply to root
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let collected = collect_documents(&[tmp.path().to_path_buf()]);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(collected.files.len(), 1);
        assert!(collected.files[0].ends_with("ok.txt"));
        assert_eq!(collected.errors.len(), 1);
        assert_eq!(collected.errors[0].kind(), FailureKind::ReadError);
        assert!(matches!(
            &collected.errors[0],
            LoadError::ReadError { path, .. } if path.ends_with("locked")
        ));
    }

    #[test]
    fn source_key_survives_deletion() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.txt");
        fs::write(&path, "soon deleted").unwrap();
        let before = source_key(&path);
        fs::remove_file(&path).unwrap();

        assert_eq!(source_key(&path), before);
        assert_eq!(
            Path::new(&before),
            fs::canonicalize(tmp.path()).unwrap().join("gone.txt")
        );
    }

    #[test]
    fn source_key_of_missing_nested_path() {
        let tmp = TempDir::new().unwrap();
        let key = source_key(&tmp.path().join("no/such/dir/file.md"));
        assert_eq!(
            Path::new(&key),
            fs::canonicalize(tmp.path()).unwrap().join("no/such/dir/file.md")
        );
    }
}
