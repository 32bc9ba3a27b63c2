use std::panic::{self, AssertUnwindSafe};

/// Extracts the text layer of a PDF.
///
/// `pdf-extract` panics on some malformed or encrypted inputs; a panic is
/// reported as an extraction error like any other.
pub fn extract_text(bytes: &[u8]) -> Result<String, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes))) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(format!("pdf extraction failed: {e}")),
        Err(_) => Err("pdf extraction failed: unreadable or encrypted document".to_string()),
    }
}
