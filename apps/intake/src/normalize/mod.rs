//! Document normalizer: raw attachment bytes into a `CandidateRecord`.
//!
//! Format detection sniffs content; provider file names and MIME types are
//! never trusted. Output depends only on the bytes and the artifact ref.

pub mod docx;
pub mod fields;
pub mod pdf;
pub mod terms;

use chrono::Datelike;
use sha2::{Digest, Sha256};

use crate::models::artifact::ArtifactRef;
use crate::models::candidate::{
    CandidateRecord, DocumentKind, NormalizationFailure, NormalizationStatus, StructuredFields,
};

/// Hex SHA-256 of the raw bytes. Used as the dedup key for delivered artifacts.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Detects the document format from its leading bytes.
pub fn sniff(bytes: &[u8]) -> Option<DocumentKind> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let first = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    if body[first..].starts_with(b"%PDF-") {
        return Some(DocumentKind::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return docx::is_docx(bytes).then_some(DocumentKind::Docx);
    }
    if !body.is_empty() && !body.contains(&0) && std::str::from_utf8(body).is_ok() {
        return Some(DocumentKind::Text);
    }
    None
}

/// Normalizes one artifact. Fails only when neither the file nor the message
/// that carried it yields any text.
pub fn normalize(
    artifact_ref: &ArtifactRef,
    raw_bytes: &[u8],
) -> Result<CandidateRecord, NormalizationFailure> {
    let raw_bytes_digest = digest(raw_bytes);

    let extracted = match sniff(raw_bytes) {
        Some(kind) => extract(kind, raw_bytes).map(|raw| (kind, clean_text(&raw))),
        None => Err("unsupported document format".to_string()),
    };
    let (document_kind, text) = match extracted {
        Ok((kind, text)) if !text.is_empty() => Ok((kind, text)),
        Ok(_) => message_fallback(artifact_ref, "no extractable text".to_string()),
        Err(reason) => message_fallback(artifact_ref, reason),
    }
    .map_err(|reason| NormalizationFailure {
        artifact_ref: artifact_ref.clone(),
        raw_bytes_digest: Some(raw_bytes_digest.clone()),
        reason,
    })?;

    let structured_fields = fields::parse(&text, artifact_ref.source_timestamp.year());
    let normalization_status = status_of(&structured_fields);

    Ok(CandidateRecord {
        artifact_ref: artifact_ref.clone(),
        raw_bytes_digest,
        document_kind,
        structured_fields,
        normalization_status,
    })
}

fn extract(kind: DocumentKind, raw_bytes: &[u8]) -> Result<String, String> {
    match kind {
        DocumentKind::Pdf => pdf::extract_text(raw_bytes),
        DocumentKind::Docx => docx::extract_text(raw_bytes),
        DocumentKind::Text | DocumentKind::Message => {
            let body = raw_bytes.strip_prefix(UTF8_BOM).unwrap_or(raw_bytes);
            Ok(String::from_utf8_lossy(body).into_owned())
        }
    }
}

/// Text of the carrying message, or the file's own failure reason.
fn message_fallback(
    artifact_ref: &ArtifactRef,
    reason: String,
) -> Result<(DocumentKind, String), String> {
    let text = artifact_ref
        .message_text
        .as_deref()
        .map(clean_text)
        .unwrap_or_default();
    if text.is_empty() {
        Err(reason)
    } else {
        Ok((DocumentKind::Message, text))
    }
}

fn status_of(fields: &StructuredFields) -> NormalizationStatus {
    let complete = fields.name.is_some()
        && !fields.contact.is_empty()
        && !fields.skills.is_empty()
        && fields.experience_years.is_some()
        && fields.location.is_some();
    if complete {
        NormalizationStatus::Complete
    } else {
        NormalizationStatus::Partial
    }
}

/// Normalizes line endings and whitespace, drops control characters and
/// collapses blank-line runs.
fn clean_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = Vec::new();
    let mut previous_blank = true;
    for line in unified.lines() {
        let line: String = line
            .chars()
            .map(|c| if c == '\u{a0}' { ' ' } else { c })
            .filter(|c| *c == '\t' || !c.is_control())
            .collect();
        let line = line.trim_end();
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        lines.push(if blank { String::new() } else { line.to_string() });
        previous_blank = blank;
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
