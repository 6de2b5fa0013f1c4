// Text extraction module
// Turns uploaded files into plain text, dispatching on the file extension


use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use pulldown_cmark::{Event, Parser, TagEnd};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("{file_type} extraction is not available in this build (enable the `{feature}` feature)")]
    LibraryUnavailable {
        file_type: FileType,
        feature: &'static str,
    },

    #[error("No text content extracted from {0}")]
    NoTextContent(String),

    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {file_type} file {}: {message}", .path.display())]
    Malformed {
        file_type: FileType,
        path: PathBuf,
        message: String,
    },
}

/// File formats the extractor knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl FileType {
    /// Detect the format from a path's extension, case-insensitively
    #[inline]
    pub fn from_path(path: &Path) -> Result<Self, ExtractionError> {
        let extension = extension_of(path);
        match extension.as_str() {
            "txt" => Ok(Self::Text),
            "md" | "markdown" => Ok(Self::Markdown),
            "pdf" => Ok(Self::Pdf),
            "docx" | "doc" => Ok(Self::Docx),
            "" => Err(ExtractionError::UnsupportedType(
                "(no extension)".to_string(),
            )),
            other => Err(ExtractionError::UnsupportedType(format!(".{}", other))),
        }
    }

    /// Extensions handled by this format, with leading dots
    #[inline]
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Text => &[".txt"],
            Self::Markdown => &[".md", ".markdown"],
            Self::Pdf => &[".pdf"],
            Self::Docx => &[".docx", ".doc"],
        }
    }

    /// Whether this build can read the format
    #[inline]
    pub fn is_available(self) -> bool {
        match self {
            Self::Text | Self::Markdown => true,
            Self::Pdf => cfg!(feature = "pdf"),
            Self::Docx => cfg!(feature = "docx"),
        }
    }
}

impl fmt::Display for FileType {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Markdown => write!(f, "markdown"),
            Self::Pdf => write!(f, "PDF"),
            Self::Docx => write!(f, "DOCX"),
        }
    }
}

/// Plain text pulled out of a file, plus the facts recorded with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    /// Lower-cased extension without the dot
    pub file_type: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentProcessor;

impl DocumentProcessor {
    #[inline]
    pub fn new() -> Self {
        for file_type in [FileType::Pdf, FileType::Docx] {
            if file_type.is_available() {
                debug!("{} extraction available", file_type);
            } else {
                debug!("{} extraction disabled in this build", file_type);
            }
        }
        Self
    }

    /// Extensions this build can extract, with leading dots
    #[inline]
    pub fn supported_types(&self) -> Vec<&'static str> {
        [
            FileType::Text,
            FileType::Markdown,
            FileType::Pdf,
            FileType::Docx,
        ]
        .into_iter()
        .filter(|file_type| file_type.is_available())
        .flat_map(|file_type| file_type.extensions().iter().copied())
        .collect()
    }

    #[inline]
    pub fn is_supported(&self, path: &Path) -> bool {
        FileType::from_path(path).is_ok_and(FileType::is_available)
    }

    /// Extract the text of `path`. `filename` is the user-facing name used in
    /// messages.
    #[inline]
    pub fn extract(&self, path: &Path, filename: &str) -> Result<ExtractedDocument, ExtractionError> {
        let file_type = FileType::from_path(path)?;

        let text = match file_type {
            FileType::Text => extract_txt(path)?,
            FileType::Markdown => markdown_to_text(&read_string(path)?),
            FileType::Pdf => extract_pdf(path)?,
            FileType::Docx => extract_docx(path)?,
        };

        if text.trim().is_empty() {
            return Err(ExtractionError::NoTextContent(filename.to_string()));
        }

        let file_size = fs::metadata(path)
            .map_err(|source| ExtractionError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        info!(
            "Extracted {} chars from {} ({})",
            text.chars().count(),
            filename,
            file_type
        );

        Ok(ExtractedDocument {
            text,
            file_type: extension_of(path),
            file_size,
        })
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ExtractionError> {
    fs::read(path).map_err(|source| ExtractionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_string(path: &Path) -> Result<String, ExtractionError> {
    Ok(String::from_utf8_lossy(&read_bytes(path)?).into_owned())
}

fn extract_txt(path: &Path) -> Result<String, ExtractionError> {
    read_string(path)
}

/// Flatten markdown to its text content, one blank line between blocks
#[inline]
pub fn markdown_to_text(markdown: &str) -> String {
    let mut text = String::new();

    for event in Parser::new(markdown) {
        match event {
            Event::Text(content) | Event::Code(content) => text.push_str(&content),
            Event::SoftBreak | Event::HardBreak => text.push('\n'),
            Event::End(
                TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::CodeBlock | TagEnd::Item,
            ) => {
                if !text.ends_with("\n\n") {
                    text.push_str(if text.ends_with('\n') { "\n" } else { "\n\n" });
                }
            }
            _ => {}
        }
    }

    text.trim().to_string()
}

#[cfg(feature = "pdf")]
fn extract_pdf(path: &Path) -> Result<String, ExtractionError> {
    let bytes = read_bytes(path)?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ExtractionError::Malformed {
        file_type: FileType::Pdf,
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_path: &Path) -> Result<String, ExtractionError> {
    Err(ExtractionError::LibraryUnavailable {
        file_type: FileType::Pdf,
        feature: "pdf",
    })
}

#[cfg(feature = "docx")]
fn extract_docx(path: &Path) -> Result<String, ExtractionError> {
    use std::io::Read;

    let malformed = |message: String| ExtractionError::Malformed {
        file_type: FileType::Docx,
        path: path.to_path_buf(),
        message,
    };

    let file = fs::File::open(path).map_err(|source| ExtractionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| malformed(e.to_string()))?;
    let mut document = archive
        .by_name("word/document.xml")
        .map_err(|e| malformed(format!("word/document.xml: {}", e)))?;

    let mut xml = String::new();
    document
        .read_to_string(&mut xml)
        .map_err(|e| malformed(e.to_string()))?;

    docx_paragraphs(&xml)
        .map(|paragraphs| paragraphs.join("\n\n"))
        .map_err(malformed)
}

#[cfg(not(feature = "docx"))]
fn extract_docx(_path: &Path) -> Result<String, ExtractionError> {
    Err(ExtractionError::LibraryUnavailable {
        file_type: FileType::Docx,
        feature: "docx",
    })
}

/// Non-blank paragraph texts of a WordprocessingML body, in document order
#[cfg(feature = "docx")]
fn docx_paragraphs(xml: &str) -> Result<Vec<String>, String> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"t" => in_text_run = true,
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text_run => {
                let text = e.unescape().map_err(|e| format!("XML parse error: {}", e))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parse error: {}", e)),
            _ => {}
        }
    }

    Ok(paragraphs)
}
