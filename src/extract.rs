//! Page extraction from files on disk.
//!
//! Turns `.txt`, `.md`, and `.pdf` files into [`SourceDocument`]s. Pages are
//! separated by form feeds (`\x0c`); a text file without form feeds is a
//! single page. `pdf-extract` emits a form feed between PDF pages.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use manual_assist_core::models::PageText;

use crate::ingest::SourceDocument;

const PAGE_BREAK: char = '\x0c';

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("PDF extraction failed for {path}: {detail}")]
    Pdf { path: PathBuf, detail: String },
    #[error("failed to walk {path}: {detail}")]
    Walk { path: PathBuf, detail: String },
}

fn is_supported(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("txt" | "md" | "pdf")
    )
}

/// Split extracted text into numbered pages, starting at 1.
pub fn split_pages(text: &str) -> Vec<PageText> {
    text.split(PAGE_BREAK)
        .enumerate()
        .map(|(i, page)| PageText::new(i as u32 + 1, page))
        .collect()
}

/// Load one file. The source id is the file name.
pub fn load_file(path: &Path) -> Result<SourceDocument, ExtractError> {
    let source_id = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ExtractError::Unsupported(path.to_path_buf()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let io_err = |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    };
    let text = match extension.as_str() {
        "txt" | "md" => std::fs::read_to_string(path).map_err(io_err)?,
        "pdf" => {
            let bytes = std::fs::read(path).map_err(io_err)?;
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ExtractError::Pdf {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?
        }
        _ => return Err(ExtractError::Unsupported(path.to_path_buf())),
    };

    let pages = split_pages(&text);
    debug!(source_id = %source_id, pages = pages.len(), "extracted pages");
    Ok(SourceDocument::new(source_id, pages))
}

/// Load a file, or every supported file under a directory (sorted by path).
/// Each entry is the result for one file.
pub fn load_path(path: &Path) -> Result<Vec<Result<SourceDocument, ExtractError>>, ExtractError> {
    if path.is_file() {
        return Ok(vec![load_file(path)]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(true) {
        let entry = entry.map_err(|e| ExtractError::Walk {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        if entry.file_type().is_file() && is_supported(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files.iter().map(|f| load_file(f)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_split_pages_on_form_feed() {
        let pages = split_pages("first page\x0csecond page");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].page_number, 2);
        assert_eq!(pages[1].text, "second page");
        assert_eq!(split_pages("only").len(), 1);
    }

    #[test]
    fn test_load_path_walks_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("pump.txt"), "Pump text").unwrap();
        fs::write(tmp.path().join("nested/compressor.md"), "Compressor text").unwrap();
        fs::write(tmp.path().join("image.png"), [0u8, 1, 2]).unwrap();

        let docs: Vec<SourceDocument> = load_path(tmp.path())
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        let ids: Vec<_> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["compressor.md", "pump.txt"]);
    }

    #[test]
    fn test_unsupported_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manual.docx");
        fs::write(&path, "x").unwrap();
        assert!(matches!(load_file(&path), Err(ExtractError::Unsupported(_))));
    }
}
