//! Document text extraction with per-page OCR fallback.
//!
//! PDFs are parsed with `lopdf` so each page can be handled on its own:
//! pages with a usable text layer are taken directly, pages that come back
//! (near-)empty are rendered and recognized with the external `pdftoppm` and
//! `tesseract` tools. When `lopdf` cannot parse a file at all, the whole
//! document goes through `pdf_extract` as a single block. Plain text and
//! Markdown files pass straight through as one-page documents.
//!
//! Output is normalized UTF-8 plus the char-offset span of every page, which
//! is what lets chunks carry page provenance without re-reading the source.

use std::path::Path;

use thiserror::Error;

use crate::config::ExtractionConfig;
use crate::models::ExtractionMethod;

/// Separator inserted between page texts in the concatenated document text.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Extraction failure for one document. Ingestion reports these per document
/// and moves on; they are never fatal to a run.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {path}")]
    Unsupported { path: String },
    #[error("PDF parse failed for {path}: {message}")]
    Pdf { path: String, message: String },
    #[error("no usable text in {path}")]
    NoText { path: String },
}

/// Char-offset range of one page inside [`Extraction::text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpan {
    /// 1-based page number in the source document.
    pub page: u32,
    pub start: usize,
    pub end: usize,
}

/// Extracted document text with page boundaries.
#[derive(Debug)]
pub struct Extraction {
    pub text: String,
    pub spans: Vec<PageSpan>,
    pub method: ExtractionMethod,
    pub page_count: u32,
}

/// Extract text from a document. `bytes` are the file contents the caller
/// already read (it needs them for content hashing); `path` is used for OCR
/// rendering and error messages.
pub async fn extract_document(
    path: &Path,
    bytes: &[u8],
    opts: &ExtractionConfig,
) -> Result<Extraction, ExtractError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" => extract_plain(path, bytes, opts),
        "pdf" => extract_pdf(path, bytes, opts).await,
        _ => Err(ExtractError::Unsupported {
            path: path.display().to_string(),
        }),
    }
}

fn extract_plain(
    path: &Path,
    bytes: &[u8],
    opts: &ExtractionConfig,
) -> Result<Extraction, ExtractError> {
    let text = normalize_text(&String::from_utf8_lossy(bytes));
    assemble(
        path,
        vec![(1, text, ExtractionMethod::Direct)],
        1,
        opts.min_text_chars,
    )
}

async fn extract_pdf(
    path: &Path,
    bytes: &[u8],
    opts: &ExtractionConfig,
) -> Result<Extraction, ExtractError> {
    let doc = match lopdf::Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "lopdf parse failed, falling back to whole-document extraction"
            );
            return extract_pdf_whole(path, bytes, opts);
        }
    };

    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    let page_count = page_numbers.len() as u32;
    if page_numbers.is_empty() {
        return Err(ExtractError::NoText {
            path: path.display().to_string(),
        });
    }

    let mut pages: Vec<(u32, String, ExtractionMethod)> = Vec::new();
    let mut ocr_available = opts.ocr_enabled;
    for page_no in page_numbers {
        let direct = normalize_text(&doc.extract_text(&[page_no]).unwrap_or_default());
        if visible_chars(&direct) >= opts.ocr_trigger_chars {
            pages.push((page_no, direct, ExtractionMethod::Direct));
            continue;
        }
        if !ocr_available {
            pages.push((page_no, direct, ExtractionMethod::Direct));
            continue;
        }
        match ocr_page(path, page_no, opts).await {
            Ok(text) => pages.push((page_no, normalize_text(&text), ExtractionMethod::Ocr)),
            Err(OcrFailure::ToolMissing(tool)) => {
                tracing::warn!(
                    path = %path.display(),
                    tool,
                    "OCR tooling not found; scanned pages will be skipped"
                );
                ocr_available = false;
                pages.push((page_no, direct, ExtractionMethod::Direct));
            }
            Err(OcrFailure::Failed(message)) => {
                tracing::warn!(path = %path.display(), page = page_no, message, "OCR failed for page");
                pages.push((page_no, direct, ExtractionMethod::Direct));
            }
        }
    }

    assemble(path, pages, page_count, opts.min_text_chars)
}

fn extract_pdf_whole(
    path: &Path,
    bytes: &[u8],
    opts: &ExtractionConfig,
) -> Result<Extraction, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    assemble(
        path,
        vec![(1, normalize_text(&text), ExtractionMethod::Direct)],
        1,
        opts.min_text_chars,
    )
}

enum OcrFailure {
    ToolMissing(String),
    Failed(String),
}

/// Render one page to an image and run it through tesseract. Both tools run
/// as external commands; a missing binary is reported as `ToolMissing` so
/// the caller can stop trying for the rest of the document.
async fn ocr_page(path: &Path, page: u32, opts: &ExtractionConfig) -> Result<String, OcrFailure> {
    let prefix = std::env::temp_dir().join(format!("quarry-ocr-{}-{}", std::process::id(), page));
    let image = prefix.with_extension("png");

    let render = tokio::process::Command::new("pdftoppm")
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg("-r")
        .arg(opts.ocr_dpi.to_string())
        .arg("-gray")
        .arg("-png")
        .arg("-singlefile")
        .arg(path)
        .arg(&prefix)
        .output()
        .await
        .map_err(|e| command_failure("pdftoppm", e))?;
    if !render.status.success() {
        let _ = std::fs::remove_file(&image);
        return Err(OcrFailure::Failed(format!(
            "pdftoppm: {}",
            String::from_utf8_lossy(&render.stderr).trim()
        )));
    }

    let recognize = tokio::process::Command::new("tesseract")
        .arg(&image)
        .arg("stdout")
        .arg("-l")
        .arg(&opts.ocr_language)
        .output()
        .await;
    let _ = std::fs::remove_file(&image);
    let recognize = recognize.map_err(|e| command_failure("tesseract", e))?;
    if !recognize.status.success() {
        return Err(OcrFailure::Failed(format!(
            "tesseract: {}",
            String::from_utf8_lossy(&recognize.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&recognize.stdout).into_owned())
}

fn command_failure(tool: &str, err: std::io::Error) -> OcrFailure {
    if err.kind() == std::io::ErrorKind::NotFound {
        OcrFailure::ToolMissing(tool.to_string())
    } else {
        OcrFailure::Failed(format!("{}: {}", tool, err))
    }
}

/// Join page texts, record spans, classify the method, and enforce the
/// document-level minimum-content threshold.
fn assemble(
    path: &Path,
    pages: Vec<(u32, String, ExtractionMethod)>,
    page_count: u32,
    min_text_chars: usize,
) -> Result<Extraction, ExtractError> {
    let mut text = String::new();
    let mut spans = Vec::new();
    let mut offset = 0usize;
    let mut direct_pages = 0usize;
    let mut ocr_pages = 0usize;

    for (page, page_text, method) in pages {
        if page_text.trim().is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str(PAGE_SEPARATOR);
            offset += PAGE_SEPARATOR.chars().count();
        }
        let len = page_text.chars().count();
        spans.push(PageSpan {
            page,
            start: offset,
            end: offset + len,
        });
        text.push_str(&page_text);
        offset += len;
        match method {
            ExtractionMethod::Ocr => ocr_pages += 1,
            _ => direct_pages += 1,
        }
    }

    if visible_chars(&text) < min_text_chars {
        return Err(ExtractError::NoText {
            path: path.display().to_string(),
        });
    }

    let method = match (direct_pages, ocr_pages) {
        (_, 0) => ExtractionMethod::Direct,
        (0, _) => ExtractionMethod::Ocr,
        _ => ExtractionMethod::Mixed,
    };
    Ok(Extraction {
        text,
        spans,
        method,
        page_count,
    })
}

/// Line endings and stray control characters folded away; tabs and newlines
/// survive.
fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            '\u{c}' => out.push('\n'),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

fn visible_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;

    fn opts() -> ExtractionConfig {
        ExtractionConfig {
            min_text_chars: 4,
            ocr_enabled: false,
            ocr_trigger_chars: 4,
            ocr_language: "eng".to_string(),
            ocr_dpi: 150,
        }
    }

    /// Hand-written single-xref PDF with one text page per entry.
    pub(crate) fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
        let n = pages.len();
        let mut objects: Vec<Vec<u8>> = Vec::new();
        let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 3 + i * 2)).collect();
        objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
        objects.push(
            format!(
                "<< /Type /Pages /Kids [{}] /Count {} >>",
                kids.join(" "),
                n
            )
            .into_bytes(),
        );
        for (i, page_text) in pages.iter().enumerate() {
            let content_id = 4 + i * 2;
            objects.push(
                format!(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 {} 0 R >> >> >>",
                    content_id,
                    3 + n * 2
                )
                .into_bytes(),
            );
            let escaped = page_text.replace('\\', "\\\\").replace('(', "\\(").replace(')', "\\)");
            let stream = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", escaped);
            let mut obj = format!("<< /Length {} >> stream\n", stream.len()).into_bytes();
            obj.extend_from_slice(stream.as_bytes());
            obj.extend_from_slice(b"\nendstream");
            objects.push(obj);
        }
        objects.push(b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_vec());

        let mut out: Vec<u8> = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj ", i + 1).as_bytes());
            out.extend_from_slice(body);
            out.extend_from_slice(b" endobj\n");
        }
        let xref_start = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
        out.extend_from_slice(b"0000000000 65535 f \n");
        for off in offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
        }
        out.extend_from_slice(
            format!(
                "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                objects.len() + 1,
                xref_start
            )
            .as_bytes(),
        );
        out
    }

    #[tokio::test]
    async fn unsupported_extension_is_an_error() {
        let err = extract_document(Path::new("notes.docx"), b"x", &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn plain_text_becomes_single_page() {
        let got = extract_document(Path::new("notes.txt"), b"alpha beta gamma", &opts())
            .await
            .unwrap();
        assert_eq!(got.text, "alpha beta gamma");
        assert_eq!(got.page_count, 1);
        assert_eq!(got.method, ExtractionMethod::Direct);
        assert_eq!(
            got.spans,
            vec![PageSpan {
                page: 1,
                start: 0,
                end: 16
            }]
        );
    }

    #[tokio::test]
    async fn whitespace_only_text_is_rejected() {
        let err = extract_document(Path::new("blank.txt"), b"  \n\t \n", &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NoText { .. }));
    }

    #[tokio::test]
    async fn pdf_pages_extract_with_spans() {
        let bytes = pdf_with_pages(&["first page words here", "second page words here"]);
        let got = extract_document(Path::new("two.pdf"), &bytes, &opts())
            .await
            .unwrap();
        assert_eq!(got.page_count, 2);
        assert_eq!(got.method, ExtractionMethod::Direct);
        assert_eq!(got.spans.len(), 2);
        assert!(got.text.contains("first page"));
        assert!(got.text.contains("second page"));
        assert_eq!(got.spans[0].page, 1);
        assert_eq!(got.spans[1].page, 2);
        assert!(got.spans[0].end <= got.spans[1].start);
    }

    #[tokio::test]
    async fn garbage_pdf_is_an_error() {
        let err = extract_document(Path::new("bad.pdf"), b"definitely not a pdf", &opts())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::Pdf { .. } | ExtractError::NoText { .. }
        ));
    }

    #[test]
    fn normalize_folds_line_endings() {
        assert_eq!(normalize_text("a\r\nb\rc\u{c}d"), "a\nb\nc\nd");
        assert_eq!(normalize_text("keep\ttabs\nand lines"), "keep\ttabs\nand lines");
    }
}
