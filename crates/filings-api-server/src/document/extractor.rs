use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Format-dispatched text extraction. Extractors read exactly the indicated
/// file and nothing else; a missing path is rejected up front.
pub struct TextExtractor;

impl TextExtractor {
    pub fn extract(file_path: &Path) -> Result<String, ExtractError> {
        if !file_path.exists() {
            return Err(ExtractError::FileNotFound(file_path.to_path_buf()));
        }

        let extension = file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "pdf" => Self::extract_pdf(file_path),
            "txt" => Self::extract_text(file_path),
            "html" | "htm" => Self::extract_html(file_path),
            other => Err(ExtractError::UnsupportedFormat(other.to_string())),
        }
    }

    fn extract_pdf(file_path: &Path) -> Result<String, ExtractError> {
        use lopdf::Document;

        let doc = Document::load(file_path).map_err(|e| ExtractError::Pdf(e.to_string()))?;
        let page_count = doc.get_pages().len();

        let mut content = String::new();
        for page_num in 1..=page_count {
            if let Ok(text) = doc.extract_text(&[page_num as u32]) {
                content.push_str(&text);
                content.push('\n');
            }
        }

        Ok(content)
    }

    /// Plain text is returned verbatim.
    fn extract_text(file_path: &Path) -> Result<String, ExtractError> {
        Ok(std::fs::read_to_string(file_path)?)
    }

    /// Strip script/style blocks, drop the remaining markup (entities are
    /// decoded by the parser), collapse whitespace runs, trim.
    fn extract_html(file_path: &Path) -> Result<String, ExtractError> {
        use scraper::{Html, Selector};

        let raw = std::fs::read_to_string(file_path)?;
        let document = Html::parse_document(&raw);

        // Selectors over static strings cannot fail to parse.
        let skip = Selector::parse("script, style").unwrap();
        let skipped: Vec<_> = document.select(&skip).map(|el| el.id()).collect();

        let mut pieces: Vec<&str> = Vec::new();
        for node in document.tree.nodes() {
            if let Some(text) = node.value().as_text() {
                let under_skipped = node
                    .ancestors()
                    .any(|ancestor| skipped.contains(&ancestor.id()));
                if !under_skipped {
                    pieces.push(&**text);
                }
            }
        }

        let joined = pieces.join(" ");
        let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");

        Ok(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_text_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "filing.txt", "line one\n  line two\n");
        assert_eq!(TextExtractor::extract(&path).unwrap(), "line one\n  line two\n");
    }

    #[test]
    fn test_html_strips_markup_and_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "filing.htm",
            "<html><head><style>p { color: red; }</style>\
             <script>var x = 1;</script></head>\
             <body><p>Revenue &amp; income</p>\n\n<div>grew   fast</div></body></html>",
        );
        assert_eq!(
            TextExtractor::extract(&path).unwrap(),
            "Revenue & income grew fast"
        );
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "filing.docx", "binaryish");
        assert!(matches!(
            TextExtractor::extract(&path),
            Err(ExtractError::UnsupportedFormat(ext)) if ext == "docx"
        ));
    }

    #[test]
    fn test_missing_path_is_rejected() {
        let missing = Path::new("/definitely/not/here.txt");
        assert!(matches!(
            TextExtractor::extract(missing),
            Err(ExtractError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_extension_dispatch_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "FILING.TXT", "upper case name");
        assert_eq!(TextExtractor::extract(&path).unwrap(), "upper case name");
    }
}
