//! Text extraction for binary and markup document formats.
//!
//! The loader hands this module raw bytes plus a [`DocumentKind`]; the
//! extractors return plain UTF-8 text. PDF goes through `pdf-extract`, DOCX
//! through `zip` + `quick-xml`, legacy Word (`.doc`) through a best-effort
//! text-run recovery over the OLE container, and HTML through a small
//! tag-stripping scanner. Plain-text kinds are decoded by
//! [`crate::loader::decode_text`] and never reach this module.

use std::any::Any;
use std::cell::Cell;
use std::io::Read;
use std::panic::UnwindSafe;
use std::sync::Once;

use quick_xml::events::Event;
use thiserror::Error;
use tracing::{debug, warn};

use crate::loader::DocumentKind;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// OLE2 compound document signature (legacy `.doc`).
const OLE_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
/// Shortest run of printable characters kept when scanning a `.doc` file.
const MIN_DOC_RUN: usize = 4;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no binary extractor for {0:?}")]
    NotBinary(DocumentKind),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("Word document extraction failed: {0}")]
    Doc(String),
}

/// Extract plain text from a binary document.
pub fn extract_binary(bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractError> {
    match kind {
        DocumentKind::Pdf => extract_pdf(bytes),
        DocumentKind::Docx => extract_docx(bytes),
        DocumentKind::Doc => extract_doc(bytes),
        other => Err(ExtractError::NotBinary(other)),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed inputs
    match catch_parser_panic(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(message) => {
            warn!("PDF parser panicked: {}", message);
            Err(ExtractError::Pdf(format!("parser panicked: {}", message)))
        }
    }
}

thread_local! {
    static IN_PARSER: Cell<bool> = const { Cell::new(false) };
}

static QUIET_HOOK: Once = Once::new();

/// Run a third-party parser, turning a panic into its message.
///
/// While the parser runs on this thread the panic hook logs at debug level
/// instead of printing to stderr; panics anywhere else reach the previous
/// hook untouched.
fn catch_parser_panic<T>(f: impl FnOnce() -> T + UnwindSafe) -> Result<T, String> {
    QUIET_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_PARSER.with(Cell::get) {
                debug!("parser panic: {}", info);
            } else {
                previous(info);
            }
        }));
    });

    IN_PARSER.with(|flag| flag.set(true));
    let result = std::panic::catch_unwind(f);
    IN_PARSER.with(|flag| flag.set(false));
    result.map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    extract_wordprocessing_text(&doc_xml)
}

/// Collect `w:t` runs, breaking lines at paragraph ends and `w:br`.
fn extract_wordprocessing_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

/// Best-effort text recovery for legacy Word binaries.
///
/// Word 97-2003 stores body text either as UTF-16LE or as 8-bit characters
/// inside the `WordDocument` stream. Without a full piece-table parser the
/// most reliable approach is to collect printable runs in both encodings and
/// keep whichever interpretation yields more text.
fn extract_doc(bytes: &[u8]) -> Result<String, ExtractError> {
    if bytes.len() < OLE_SIGNATURE.len() || bytes[..OLE_SIGNATURE.len()] != OLE_SIGNATURE {
        return Err(ExtractError::Doc(
            "not an OLE compound document".to_string(),
        ));
    }

    let wide = utf16_runs(bytes);
    let narrow = ascii_runs(bytes);
    let text = if wide.chars().count() >= narrow.chars().count() {
        wide
    } else {
        narrow
    };

    if text.trim().is_empty() {
        return Err(ExtractError::Doc("no extractable text".to_string()));
    }
    Ok(text)
}

fn is_printable(c: char) -> bool {
    !c.is_control() || c == '\n' || c == '\t'
}

fn utf16_runs(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let mut runs = Vec::new();
    let mut current = String::new();
    for decoded in char::decode_utf16(units) {
        match decoded {
            Ok(c) if c == '\r' => current.push('\n'),
            Ok(c) if is_printable(c) && c != '\u{FFFD}' => current.push(c),
            _ => flush_run(&mut runs, &mut current),
        }
    }
    flush_run(&mut runs, &mut current);
    runs.join("\n")
}

fn ascii_runs(bytes: &[u8]) -> String {
    let mut runs = Vec::new();
    let mut current = String::new();
    for &b in bytes {
        match b {
            b'\r' => current.push('\n'),
            0x20..=0x7E | b'\t' | b'\n' => current.push(b as char),
            _ => flush_run(&mut runs, &mut current),
        }
    }
    flush_run(&mut runs, &mut current);
    runs.join("\n")
}

fn flush_run(runs: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if trimmed.chars().filter(|c| c.is_alphanumeric()).count() >= MIN_DOC_RUN {
        runs.push(trimmed.to_string());
    }
    current.clear();
}

/// Elements whose content is never visible text.
const HTML_SKIP_ELEMENTS: &[&str] = &["script", "style", "head", "noscript", "template"];
/// Elements that start a new line in rendered output.
const HTML_BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6",
    "section", "article", "header", "footer", "pre", "blockquote", "hr", "title", "dd", "dt",
];

/// Convert HTML markup to plain text.
///
/// Drops comments and the contents of non-visible elements, turns block
/// elements into line breaks, decodes common entities, and collapses runs of
/// spaces. Tolerant of malformed markup: an unterminated tag ends the input.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut skip_until: Option<String> = None;

    while !rest.is_empty() {
        let Some(lt) = rest.find('<') else {
            if skip_until.is_none() {
                out.push_str(&decode_entities(rest));
            }
            break;
        };
        if skip_until.is_none() {
            out.push_str(&decode_entities(&rest[..lt]));
        }
        rest = &rest[lt..];

        if rest.starts_with("<!--") {
            rest = match rest.find("-->") {
                Some(end) => &rest[end + 3..],
                None => "",
            };
            continue;
        }

        let Some(gt) = rest.find('>') else {
            break;
        };
        let tag = &rest[1..gt];
        rest = &rest[gt + 1..];

        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if let Some(ref skipped) = skip_until {
            if closing && &name == skipped {
                skip_until = None;
            }
            continue;
        }

        if !closing && !tag.ends_with('/') && HTML_SKIP_ELEMENTS.contains(&name.as_str()) {
            skip_until = Some(name);
            continue;
        }

        if HTML_BLOCK_ELEMENTS.contains(&name.as_str()) {
            out.push('\n');
        } else if name == "td" || name == "th" {
            out.push('\t');
        }
    }

    normalize_whitespace(&out)
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            decode_entity(entity).map(|c| (c, semi + 1))
        });
        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "copy" => Some('©'),
        "mdash" => Some('—'),
        "ndash" => Some('–'),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !lines.is_empty() {
                lines.push(String::new());
            }
        } else {
            blank_run = 0;
            lines.push(collapsed);
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parser_panics_become_messages() {
        let err = catch_parser_panic(|| -> u32 { panic!("bad xref table") }).unwrap_err();
        assert_eq!(err, "bad xref table");
        let err = catch_parser_panic(|| -> u32 { panic!("offset {}", 42) }).unwrap_err();
        assert_eq!(err, "offset 42");
        assert!(!IN_PARSER.with(Cell::get));
        assert_eq!(catch_parser_panic(|| 7).unwrap(), 7);
    }

    fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let body: String = paragraphs
                .iter()
                .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
                .collect();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = docx_with_paragraphs(&["First paragraph", "Second &amp; last"]);
        let text = extract_binary(&bytes, DocumentKind::Docx).unwrap();
        assert_eq!(text, "First paragraph\nSecond & last");
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_binary(b"not a pdf", DocumentKind::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_binary(b"not a zip", DocumentKind::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn doc_requires_ole_signature() {
        let err = extract_binary(b"plain bytes", DocumentKind::Doc).unwrap_err();
        assert!(matches!(err, ExtractError::Doc(_)));
    }

    #[test]
    fn doc_recovers_utf16_text() {
        let mut bytes = OLE_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 24]);
        for unit in "麒麟系统安装指南 chapter one".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0u8; 16]);
        let text = extract_binary(&bytes, DocumentKind::Doc).unwrap();
        assert!(text.contains("麒麟系统安装指南 chapter one"), "got: {:?}", text);
    }

    #[test]
    fn text_kinds_are_not_binary() {
        let err = extract_binary(b"hello", DocumentKind::Text).unwrap_err();
        assert!(matches!(err, ExtractError::NotBinary(DocumentKind::Text)));
    }

    #[test]
    fn html_strips_markup_and_scripts() {
        let html = r#"<html><head><title>T</title><style>p { color: red }</style></head>
<body><h1>Install&nbsp;Guide</h1><!-- hidden --><p>Run <b>apt</b> &amp; reboot.</p>
<script>var x = "<p>no</p>";</script><ul><li>one</li><li>two &#x4E2D;</li></ul></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Install Guide"));
        assert!(text.contains("Run apt & reboot."));
        assert!(text.contains("two 中"));
        assert!(!text.contains("color"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn html_unknown_entity_kept_verbatim() {
        assert_eq!(html_to_text("a &bogus; b & c"), "a &bogus; b & c");
    }
}
