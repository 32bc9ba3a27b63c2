use std::io::{Cursor, Read};

use zip::ZipArchive;

const BODY_PART: &str = "word/document.xml";

/// True when `bytes` is a ZIP archive carrying a WordprocessingML body.
pub fn is_docx(bytes: &[u8]) -> bool {
    ZipArchive::new(Cursor::new(bytes))
        .map(|archive| archive.file_names().any(|name| name == BODY_PART))
        .unwrap_or(false)
}

/// Extracts visible text: body first, then headers, then footers.
/// Parts are visited in name order so output never depends on archive layout.
pub fn extract_text(bytes: &[u8]) -> Result<String, String> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("docx archive unreadable: {e}"))?;

    let mut headers: Vec<String> = Vec::new();
    let mut footers: Vec<String> = Vec::new();
    for name in archive.file_names() {
        if is_part(name, "word/header") {
            headers.push(name.to_string());
        } else if is_part(name, "word/footer") {
            footers.push(name.to_string());
        }
    }
    headers.sort();
    footers.sort();

    let mut sections = Vec::new();
    for part in std::iter::once(BODY_PART.to_string())
        .chain(headers)
        .chain(footers)
    {
        let xml = read_part(&mut archive, &part)?;
        let text = wordml_text(&xml);
        if !text.trim().is_empty() {
            sections.push(text);
        }
    }
    Ok(sections.join("\n"))
}

fn is_part(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix) && name.ends_with(".xml") && !name.contains("/_rels/")
}

fn read_part(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String, String> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| format!("docx part {name} missing: {e}"))?;
    let mut xml = String::new();
    file.read_to_string(&mut xml)
        .map_err(|e| format!("docx part {name} unreadable: {e}"))?;
    Ok(xml)
}

/// Walks WordprocessingML and keeps run text. Paragraph ends, breaks and table
/// cells become newlines; tabs stay tabs.
fn wordml_text(xml: &str) -> String {
    let mut out = String::new();
    let mut in_text = false;
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        if in_text {
            out.push_str(&unescape(&rest[..open]));
        }
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag = &rest[open + 1..open + close];
        let closing = tag.starts_with('/');
        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");

        match (name, closing) {
            ("w:t", false) => in_text = !self_closing,
            ("w:t", true) => in_text = false,
            ("w:tab", false) => out.push('\t'),
            ("w:br", false) | ("w:cr", false) => out.push('\n'),
            ("w:p", true) | ("w:tc", true) => out.push('\n'),
            _ => {}
        }
        rest = &rest[open + close + 1..];
    }

    out.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Builds a minimal .docx with the given parts.
    pub(crate) fn build_docx(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, body) in parts {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    pub(crate) fn paragraph_xml(paragraphs: &[&str]) -> String {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{p}</w:t></w:r></w:p>"))
            .collect();
        format!("<?xml version=\"1.0\"?><w:document><w:body>{body}</w:body></w:document>")
    }

    #[test]
    fn test_detects_docx_by_body_part() {
        let docx = build_docx(&[(BODY_PART, &paragraph_xml(&["Jane Doe"]))]);
        assert!(is_docx(&docx));

        let plain_zip = build_docx(&[("notes.txt", "hello")]);
        assert!(!is_docx(&plain_zip));
    }

    #[test]
    fn test_extracts_paragraphs_then_headers_then_footers() {
        let docx = build_docx(&[
            ("word/footer1.xml", &paragraph_xml(&["Page footer"])),
            (BODY_PART, &paragraph_xml(&["Jane Doe", "Skills: Verilog"])),
            ("word/header1.xml", &paragraph_xml(&["Resume"])),
        ]);
        let text = extract_text(&docx).unwrap();
        assert_eq!(text, "Jane Doe\nSkills: Verilog\nResume\nPage footer");
    }

    #[test]
    fn test_runs_within_paragraph_are_joined() {
        let xml = "<w:p><w:r><w:t>Senior </w:t></w:r><w:r><w:t>Engineer</w:t></w:r><w:r><w:tab/><w:t>2019</w:t></w:r></w:p>";
        assert_eq!(wordml_text(xml), "Senior Engineer\t2019");
    }

    #[test]
    fn test_entities_are_decoded() {
        assert_eq!(unescape("R&amp;D &lt;RTL&gt; &#233;t&#xE9;"), "R&D <RTL> été");
        assert_eq!(unescape("AT&T"), "AT&T");
    }

    #[test]
    fn test_table_cells_become_lines() {
        let xml = "<w:tbl><w:tr><w:tc><w:p><w:r><w:t>Python</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>C++</w:t></w:r></w:p></w:tc></w:tr></w:tbl>";
        assert_eq!(wordml_text(xml), "Python\nC++");
    }
}
