//! Text extraction for downloaded documents.
//!
//! Stores hand back raw bytes plus a content type; this module turns them into
//! plain UTF-8 text for chunking. Text formats are decoded directly, PDF goes
//! through `pdf-extract`, and Word/PowerPoint OOXML packages are unzipped and
//! their text runs collected with `quick-xml`.

use std::io::Read;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Upper bound on a single decompressed XML part (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Map a file name's extension to the content type used for extraction.
pub fn content_type_for(name: &str) -> String {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "yaml" | "yml" => "text/yaml",
        "rst" => "text/x-rst",
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Extract plain text from document bytes.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
        }
        MIME_DOCX => {
            let mut archive = open_package(bytes)?;
            let xml = read_part(&mut archive, "word/document.xml")?;
            collect_text_runs(&xml, "\n")
        }
        MIME_PPTX => extract_pptx(bytes),
        ct if is_textual(ct) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn is_textual(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/json"
}

type Package<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_package(bytes: &[u8]) -> Result<Package<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_part(archive: &mut Package<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!("{} exceeds size limit", name)));
    }
    Ok(out)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_package(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut texts = Vec::with_capacity(slides.len());
    for name in slides {
        let xml = read_part(&mut archive, &name)?;
        let text = collect_text_runs(&xml, " ")?;
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok(texts.join("\n\n"))
}

/// Concatenate the contents of `<*:t>` elements, separating paragraphs
/// (`<*:p>`) with `paragraph_sep`.
fn collect_text_runs(xml: &[u8], paragraph_sep: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if !out.is_empty() && !out.ends_with(paragraph_sep) => {
                    out.push_str(paragraph_sep)
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn package(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in parts {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn content_types_from_names() {
        assert_eq!(content_type_for("Bid.DOCX"), MIME_DOCX);
        assert_eq!(content_type_for("notes.md"), "text/markdown");
        assert_eq!(content_type_for("scan.tiff"), "application/octet-stream");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn plain_text_is_decoded() {
        let text = extract_text("hello\nworld".as_bytes(), "text/plain").unwrap();
        assert_eq!(text, "hello\nworld");
    }

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_are_separated() {
        let doc = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
<w:p><w:r><w:t>Scope of work</w:t></w:r></w:p>
<w:p><w:r><w:t>Pricing </w:t></w:r><w:r><w:t>schedule</w:t></w:r></w:p>
</w:body></w:document>"#;
        let bytes = package(&[("word/document.xml", doc)]);
        let text = extract_text(&bytes, MIME_DOCX).unwrap();
        assert_eq!(text, "Scope of work\nPricing schedule");
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let slide = |t: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><p:cSld><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:cSld></p:sld>"#,
                t
            )
        };
        let s1 = slide("one");
        let s2 = slide("two");
        let s10 = slide("ten");
        let bytes = package(&[
            ("ppt/slides/slide10.xml", &s10),
            ("ppt/slides/slide2.xml", &s2),
            ("ppt/slides/slide1.xml", &s1),
        ]);
        let text = extract_text(&bytes, MIME_PPTX).unwrap();
        assert_eq!(text, "one\n\ntwo\n\nten");
    }
}
