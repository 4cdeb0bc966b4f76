//! XLSX extractor (spec §4.3.3). A decoder in front of the CSV extractor, not a peer: it reads
//! the first worksheet into an all-strings table, serializes it back to CSV text, and hands that
//! to the CSV extractor.

use crate::archive::is_zip;
use mrf_core::{ColumnHints, Error, IntermediateRow, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Write;

/// Detects bytes that are actually a CSV masquerading as an XLSX: a UTF-8 BOM, a leading double
/// quote, or low-byte printable density with commas and no ZIP magic (spec §4.3.3).
fn looks_like_csv_in_disguise(bytes: &[u8]) -> bool {
    if is_zip(bytes) {
        return false;
    }
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return true;
    }
    if bytes.first() == Some(&b'"') {
        return true;
    }
    let sample = &bytes[..bytes.len().min(256)];
    let printable = sample
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    let density = printable as f64 / sample.len().max(1) as f64;
    density > 0.95 && sample.contains(&b',')
}

pub fn extract_xlsx(bytes: &[u8], hints: Option<&ColumnHints>) -> Result<Vec<IntermediateRow>> {
    if looks_like_csv_in_disguise(bytes) {
        return super::csv_extractor::extract_csv(bytes, hints);
    }
    let csv_text = workbook_to_csv(bytes)?;
    super::csv_extractor::extract_csv(csv_text.as_bytes(), hints)
}

/// Reads the first worksheet of an XLSX (OOXML ZIP) into an all-strings CSV document by parsing
/// `xl/sharedStrings.xml` and `xl/worksheets/sheet1.xml` directly.
fn workbook_to_csv(bytes: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| Error::BadZipFile(e.to_string()))?;

    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_xml = read_member(&mut archive, "xl/worksheets/sheet1.xml")
        .ok_or_else(|| Error::BadZipFile("missing xl/worksheets/sheet1.xml".to_string()))?;

    let rows = parse_sheet_rows(&sheet_xml, &shared_strings)?;
    let mut out = Vec::new();
    {
        let mut writer = csv::WriterBuilder::new().from_writer(&mut out);
        for row in rows {
            writer
                .write_record(&row)
                .map_err(|e| Error::ParserError(e.to_string()))?;
        }
        writer.flush().map_err(|e| Error::ParserError(e.to_string()))?;
    }
    String::from_utf8(out).map_err(|e| Error::DecodeError(e.to_string()))
}

fn read_member(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>, name: &str) -> Option<Vec<u8>> {
    let mut file = archive.by_name(name).ok()?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut file, &mut buf).ok()?;
    Some(buf)
}

fn read_shared_strings(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Result<Vec<String>> {
    let Some(xml) = read_member(archive, "xl/sharedStrings.xml") else {
        return Ok(Vec::new());
    };
    let mut reader = Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);

    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"si" => current.clear(),
            Ok(Event::Start(e)) if e.name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"t" => in_text = false,
            Ok(Event::End(e)) if e.name().as_ref() == b"si" => strings.push(current.clone()),
            Ok(Event::Text(t)) if in_text => {
                current.push_str(&t.unescape().map_err(|e| Error::ParserError(e.to_string()))?);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::ParserError(e.to_string())),
        }
        buf.clear();
    }
    Ok(strings)
}

fn col_letters_to_index(cell_ref: &str) -> usize {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let mut idx = 0usize;
    for c in letters.chars() {
        idx = idx * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    idx.saturating_sub(1)
}

fn parse_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut cell_col: usize = 0;
    let mut cell_is_shared_string = false;
    let mut in_value = false;
    let mut value_text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"row" => {
                current_row = Vec::new();
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"row" => {
                rows.push(std::mem::take(&mut current_row));
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"c" => {
                cell_is_shared_string = false;
                let mut cell_ref = String::new();
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"r" => cell_ref = String::from_utf8_lossy(&attr.value).into_owned(),
                        b"t" => {
                            cell_is_shared_string = attr.value.as_ref() == b"s";
                        }
                        _ => {}
                    }
                }
                cell_col = if cell_ref.is_empty() {
                    current_row.len()
                } else {
                    col_letters_to_index(&cell_ref)
                };
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"v" => {
                in_value = true;
                value_text.clear();
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"v" => {
                in_value = false;
                while current_row.len() <= cell_col {
                    current_row.push(String::new());
                }
                let resolved = if cell_is_shared_string {
                    value_text
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i))
                        .cloned()
                        .unwrap_or_default()
                } else {
                    value_text.clone()
                };
                current_row[cell_col] = resolved;
            }
            Ok(Event::Text(t)) if in_value => {
                value_text.push_str(&t.unescape().map_err(|e| Error::ParserError(e.to_string()))?);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::ParserError(e.to_string())),
        }
        buf.clear();
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_xlsx() -> Vec<u8> {
        let shared_strings_xml = br#"<?xml version="1.0"?><sst xmlns="x" count="1" uniqueCount="1"><si><t>code</t></si></sst>"#;
        let sheet_xml = br#"<?xml version="1.0"?><worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>price</v></c></row>
            <row r="2"><c r="A2"><v>99213</v></c><c r="B2"><v>100</v></c></row>
        </sheetData></worksheet>"#;

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::FileOptions::default();
            writer.start_file("xl/sharedStrings.xml", opts).unwrap();
            writer.write_all(shared_strings_xml).unwrap();
            writer.start_file("xl/worksheets/sheet1.xml", opts).unwrap();
            writer.write_all(sheet_xml).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn reads_first_worksheet_with_shared_strings() {
        let xlsx = build_minimal_xlsx();
        let csv_text = workbook_to_csv(&xlsx).unwrap();
        assert!(csv_text.contains("code"));
        assert!(csv_text.contains("99213"));
        assert!(csv_text.contains("100"));
    }

    #[test]
    fn detects_csv_in_disguise_via_bom() {
        let bytes = [0xEF, 0xBB, 0xBF, b'a', b',', b'b'];
        assert!(looks_like_csv_in_disguise(&bytes));
    }

    #[test]
    fn detects_csv_in_disguise_via_leading_quote() {
        assert!(looks_like_csv_in_disguise(b"\"code\",\"price\"\n"));
    }

    #[test]
    fn real_zip_bytes_are_not_flagged_as_csv_in_disguise() {
        assert!(!looks_like_csv_in_disguise(&build_minimal_xlsx()));
    }

    #[test]
    fn col_letters_to_index_handles_single_and_double_letters() {
        assert_eq!(col_letters_to_index("A1"), 0);
        assert_eq!(col_letters_to_index("B2"), 1);
        assert_eq!(col_letters_to_index("AA1"), 26);
    }
}
