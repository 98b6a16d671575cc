//! C5: bytes + content-type + filename → normalized plain text (§4.5).

use std::io::Cursor;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use common::error::AppError;
use roxmltree::Document as XmlDocument;
use zip::ZipArchive;

const SUPPORTED_CONTENT_TYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Parse raw bytes into a single normalized string (§4.5). Synchronous and
/// CPU-bound; callers run it on a blocking thread (`spawn_blocking`) rather
/// than holding an async suspension point open across it.
pub fn parse(bytes: &[u8], content_type: &str, filename: &str) -> Result<String, AppError> {
    let raw = match content_type {
        "text/plain" => decode_utf8_strict(bytes, filename)?,
        "text/markdown" => decode_utf8_strict(bytes, filename)?,
        "application/pdf" => parse_pdf(bytes, filename)?,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            parse_docx(bytes, filename)?
        }
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            parse_pptx(bytes, filename)?
        }
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
            parse_xlsx(bytes, filename)?
        }
        other => return Err(AppError::UnsupportedType(other.to_string())),
    };

    Ok(normalize(&raw))
}

pub fn is_supported(content_type: &str) -> bool {
    SUPPORTED_CONTENT_TYPES.contains(&content_type)
}

fn decode_utf8_strict(bytes: &[u8], filename: &str) -> Result<String, AppError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| AppError::ParseError {
        filename: filename.to_string(),
        cause: e.to_string(),
    })
}

fn parse_pdf(bytes: &[u8], filename: &str) -> Result<String, AppError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| AppError::ParseError {
        filename: filename.to_string(),
        cause: e.to_string(),
    })
}

fn open_zip(bytes: &[u8], filename: &str) -> Result<ZipArchive<Cursor<&[u8]>>, AppError> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| AppError::ParseError {
        filename: filename.to_string(),
        cause: e.to_string(),
    })
}

/// DOCX is a zip of OOXML parts; the document body lives at
/// `word/document.xml`, text runs in `<w:t>` elements.
fn parse_docx(bytes: &[u8], filename: &str) -> Result<String, AppError> {
    let mut archive = open_zip(bytes, filename)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml", filename)?;
    Ok(extract_xml_text(&xml, filename, "w:t")?)
}

/// PPTX slides live at `ppt/slides/slideN.xml`, text runs in `<a:t>`.
fn parse_pptx(bytes: &[u8], filename: &str) -> Result<String, AppError> {
    let mut archive = open_zip(bytes, filename)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    slide_names.sort_by_key(|name| slide_sort_key(name));

    if slide_names.is_empty() {
        return Err(AppError::ParseError {
            filename: filename.to_string(),
            cause: "no slides found in presentation".to_string(),
        });
    }

    let mut slides = Vec::with_capacity(slide_names.len());
    for name in &slide_names {
        let xml = read_zip_entry(&mut archive, name, filename)?;
        slides.push(extract_xml_text(&xml, filename, "a:t")?);
    }
    Ok(slides.join("\n\n"))
}

fn slide_sort_key(name: &str) -> u32 {
    name.rsplit("slide")
        .next()
        .and_then(|rest| rest.split('.').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn read_zip_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    entry: &str,
    filename: &str,
) -> Result<String, AppError> {
    use std::io::Read;
    let mut file = archive.by_name(entry).map_err(|e| AppError::ParseError {
        filename: filename.to_string(),
        cause: format!("missing {entry}: {e}"),
    })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| AppError::ParseError {
            filename: filename.to_string(),
            cause: e.to_string(),
        })?;
    Ok(contents)
}

fn extract_xml_text(xml: &str, filename: &str, text_tag: &str) -> Result<String, AppError> {
    let doc = XmlDocument::parse(xml).map_err(|e| AppError::ParseError {
        filename: filename.to_string(),
        cause: e.to_string(),
    })?;

    let local_name = text_tag.split(':').next_back().unwrap_or(text_tag);
    let mut out = String::new();
    for node in doc.descendants() {
        if node.is_element() && node.tag_name().name() == local_name {
            if let Some(text) = node.text() {
                out.push_str(text);
            }
        }
        if node.is_element() && matches!(node.tag_name().name(), "p" | "br") {
            out.push('\n');
        }
    }
    Ok(out)
}

fn parse_xlsx(bytes: &[u8], filename: &str) -> Result<String, AppError> {
    let mut workbook: Xlsx<_> =
        open_workbook_from_rs(Cursor::new(bytes)).map_err(|e| AppError::ParseError {
            filename: filename.to_string(),
            cause: e.to_string(),
        })?;

    let mut sheets_text = Vec::new();
    for sheet_name in workbook.sheet_names().to_owned() {
        let Ok(range) = workbook.worksheet_range(&sheet_name) else {
            continue;
        };
        let mut rows_text = Vec::new();
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            let line = cells.join("\t");
            if !line.trim().is_empty() {
                rows_text.push(line);
            }
        }
        if !rows_text.is_empty() {
            sheets_text.push(format!("{sheet_name}\n{}", rows_text.join("\n")));
        }
    }
    Ok(sheets_text.join("\n\n"))
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(d) => d.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERROR:{e:?}"),
    }
}

/// Normalization common to every content type (§4.5):
/// strip zero-width characters, collapse newline/space runs, trim edges,
/// while preserving paragraph breaks (double newline) as chunker hints.
fn normalize(input: &str) -> String {
    const ZERO_WIDTH: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{00AD}'];

    let stripped: String = input.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();

    let mut collapsed_spaces = String::with_capacity(stripped.len());
    let mut space_run = 0usize;
    for c in stripped.chars() {
        if c == ' ' {
            space_run += 1;
            if space_run <= 1 {
                collapsed_spaces.push(c);
            }
        } else {
            space_run = 0;
            collapsed_spaces.push(c);
        }
    }

    let mut out = String::with_capacity(collapsed_spaces.len());
    let mut newline_run = 0usize;
    for c in collapsed_spaces.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_round_trips_through_normalization() {
        let text = parse(b"alpha\n\nbeta\n\ngamma", "text/plain", "hello.txt").unwrap();
        assert_eq!(text, "alpha\n\nbeta\n\ngamma");
    }

    #[test]
    fn unsupported_type_fails() {
        let err = parse(b"whatever", "application/x-unknown", "f").unwrap_err();
        assert!(matches!(err, AppError::UnsupportedType(_)));
    }

    #[test]
    fn invalid_utf8_fails_with_parse_error() {
        let err = parse(&[0xFF, 0xFE, 0xFD], "text/plain", "bad.txt").unwrap_err();
        assert!(matches!(err, AppError::ParseError { .. }));
    }

    #[test]
    fn collapses_excess_newlines_and_spaces() {
        let text = parse(
            b"alpha\n\n\n\nbeta   gamma",
            "text/plain",
            "messy.txt",
        )
        .unwrap();
        assert_eq!(text, "alpha\n\nbeta gamma");
    }

    #[test]
    fn strips_zero_width_characters() {
        let input = "a\u{200B}b\u{FEFF}c".as_bytes();
        let text = parse(input, "text/plain", "zw.txt").unwrap();
        assert_eq!(text, "abc");
    }

    #[test]
    fn trims_leading_and_trailing_whitespace() {
        let text = parse(b"  \n hello \n  ", "text/plain", "trim.txt").unwrap();
        assert_eq!(text, "hello");
    }
}
