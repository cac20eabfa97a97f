//! File utilities for document ingestion.

use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::IngestError;

/// Page separator emitted by `pdftotext`.
pub const PAGE_BREAK: char = '\u{c}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Text,
}

impl DocumentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Text => "text",
        }
    }
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn calculate_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Decide how a file should be read, or `None` when it cannot be ingested.
pub fn detect_format(path: &Path) -> Option<DocumentFormat> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => Some(DocumentFormat::Pdf),
        "txt" | "md" | "markdown" | "rst" | "text" | "csv" | "json" | "jsonl" | "html"
        | "htm" | "xml" => Some(DocumentFormat::Text),
        _ if is_binary_extension(&ext) => None,
        _ if looks_like_text(path) => Some(DocumentFormat::Text),
        _ => None,
    }
}

/// Sniff the first bytes for NUL, the usual binary marker.
fn looks_like_text(path: &Path) -> bool {
    let Ok(file) = fs::File::open(path) else {
        return false;
    };
    let mut buffer = [0u8; 512];
    let mut reader = std::io::BufReader::new(file);
    match reader.read(&mut buffer) {
        Ok(0) => true,
        Ok(n) => !buffer[..n].contains(&0),
        Err(_) => false,
    }
}

fn is_binary_extension(ext: &str) -> bool {
    matches!(
        ext,
        "exe"
            | "dll"
            | "so"
            | "dylib"
            | "png"
            | "jpg"
            | "jpeg"
            | "gif"
            | "bmp"
            | "webp"
            | "mp3"
            | "mp4"
            | "zip"
            | "tar"
            | "gz"
            | "7z"
            | "doc"
            | "docx"
            | "xls"
            | "xlsx"
            | "ppt"
            | "pptx"
            | "db"
            | "sqlite"
            | "bin"
            | "onnx"
    )
}

/// Read a UTF-8 text file with a size limit.
pub fn read_text_file(path: &Path, max_size: u64) -> Result<String, IngestError> {
    let metadata = fs::metadata(path).map_err(|e| not_found_or(path, e))?;

    if metadata.len() > max_size {
        return Err(IngestError::Parse {
            path: path.to_path_buf(),
            message: format!("file exceeds maximum size: {} > {}", metadata.len(), max_size),
        });
    }

    let bytes = fs::read(path).map_err(|e| not_found_or(path, e))?;
    String::from_utf8(bytes).map_err(|e| IngestError::Parse {
        path: path.to_path_buf(),
        message: format!("not valid UTF-8: {}", e),
    })
}

/// Extract text from a PDF with the `pdftotext` binary (poppler-utils).
pub async fn extract_pdf_text(path: &Path, pdftotext: &str) -> Result<String, IngestError> {
    if !path.exists() {
        return Err(IngestError::NotFound(path.to_path_buf()));
    }

    tracing::debug!(path = %path.display(), "extracting PDF text");
    let output = tokio::process::Command::new(pdftotext)
        .arg("-layout")
        .arg("-enc")
        .arg("UTF-8")
        .arg(path)
        .arg("-")
        .output()
        .await
        .map_err(|e| IngestError::Parse {
            path: path.to_path_buf(),
            message: format!("failed to run {} (is poppler installed?): {}", pdftotext, e),
        })?;

    if !output.status.success() {
        return Err(IngestError::Parse {
            path: path.to_path_buf(),
            message: format!(
                "{} failed: {}",
                pdftotext,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.trim().is_empty() {
        return Err(IngestError::Parse {
            path: path.to_path_buf(),
            message: "no extractable text (scanned PDF?)".to_string(),
        });
    }
    Ok(text)
}

/// Split extracted text into `(page_number, text)` pairs on form feeds.
/// Pages are numbered from 1; blank pages are skipped.
pub fn split_pages(text: &str) -> Vec<(u32, &str)> {
    text.split(PAGE_BREAK)
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| (i as u32 + 1, page))
        .collect()
}

pub fn file_display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn not_found_or(path: &Path, err: std::io::Error) -> IngestError {
    if err.kind() == std::io::ErrorKind::NotFound {
        IngestError::NotFound(path.to_path_buf())
    } else {
        IngestError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_calculate_checksum() {
        let checksum = calculate_checksum(b"hello world");
        assert_eq!(checksum.len(), 64);
    }

    #[test]
    fn test_detect_format_by_extension() {
        assert_eq!(
            detect_format(&PathBuf::from("gdpr.PDF")),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(
            detect_format(&PathBuf::from("policy.md")),
            Some(DocumentFormat::Text)
        );
        assert_eq!(detect_format(&PathBuf::from("scan.png")), None);
    }

    #[test]
    fn test_detect_format_sniffs_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.policy");
        std::fs::write(&text, "Retention is 90 days.").unwrap();
        assert_eq!(detect_format(&text), Some(DocumentFormat::Text));

        let binary = dir.path().join("blob.policy");
        std::fs::write(&binary, [0u8, 1, 2, 3]).unwrap();
        assert_eq!(detect_format(&binary), None);
    }

    #[test]
    fn test_read_text_file_missing_is_not_found() {
        let err = read_text_file(Path::new("/definitely/not/here.txt"), 1024).unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[test]
    fn test_read_text_file_enforces_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(100)).unwrap();
        assert!(matches!(
            read_text_file(&path, 10),
            Err(IngestError::Parse { .. })
        ));
        assert_eq!(read_text_file(&path, 1000).unwrap().len(), 100);
    }

    #[test]
    fn test_split_pages() {
        let pages = split_pages("page one\u{c}\u{c}page three");
        assert_eq!(pages, vec![(1, "page one"), (3, "page three")]);
    }

    #[tokio::test]
    async fn test_extract_pdf_missing_file() {
        let err = extract_pdf_text(Path::new("/nope/missing.pdf"), "pdftotext")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
