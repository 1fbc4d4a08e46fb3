//! Text decoding heuristics for provider exports.
//!
//! Some exports apply UTF-8 encoding twice, so a plain decode yields mojibake
//! such as "Ã©" for "é". [`smart_decode`] tries the repaired reading first,
//! then the plain one, then UTF-16BE, and accepts the first candidate made
//! only of printable characters.

use serde_json::Value;
use tracing::debug;

use crate::error::DecodeError;

const APPLE_LOGO: char = '\u{f8ff}';

fn is_private_use(c: char) -> bool {
    matches!(c as u32, 0xE000..=0xF8FF | 0xF_0000..=0xF_FFFD | 0x10_0000..=0x10_FFFD)
}

fn is_printable_char(c: char) -> bool {
    match c {
        '\n' | '\r' | '\t' | APPLE_LOGO => true,
        '\u{fffe}' | '\u{ffff}' => false,
        c if c.is_control() => false,
        c => !is_private_use(c),
    }
}

/// True if every character is a letter, mark, number, symbol, punctuation,
/// separator, format character or one of `\n`, `\r`, `\t`, U+F8FF.
pub fn is_printable(text: &str) -> bool {
    text.chars().all(is_printable_char)
}

/// Reinterprets each char as a Latin-1 byte and decodes the result as UTF-8.
fn undo_double_encoding(text: &str) -> Option<String> {
    let bytes = text
        .chars()
        .map(|c| u8::try_from(c as u32).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Strict UTF-16BE decode. Odd lengths and unpaired surrogates fail.
pub fn decode_utf16be(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units = data.chunks_exact(2).map(|p| u16::from_be_bytes([p[0], p[1]]));
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

fn normalize_newlines(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Decodes bytes to text, undoing double UTF-8 encoding and falling back to
/// UTF-16BE. Line endings are normalized to `\n`.
pub fn smart_decode(data: &[u8]) -> Result<String, DecodeError> {
    let basic = std::str::from_utf8(data).ok();
    if let Some(basic) = basic {
        if let Some(double) = undo_double_encoding(basic) {
            if is_printable(&double) {
                return Ok(normalize_newlines(&double));
            }
        }
        if is_printable(basic) {
            return Ok(normalize_newlines(basic));
        }
    }
    match decode_utf16be(data) {
        Some(text) if is_printable(&text) => Ok(normalize_newlines(&text)),
        _ => {
            debug!(len = data.len(), "smart decode failed");
            Err(DecodeError::NotPrintable)
        }
    }
}

/// Repairs one already-decoded string: the double-encoded reading if it is
/// printable, else the string itself if printable.
pub fn smart_decode_text(text: &str) -> Result<String, DecodeError> {
    if let Some(double) = undo_double_encoding(text) {
        if is_printable(&double) {
            return Ok(double);
        }
    }
    if is_printable(text) {
        return Ok(text.to_string());
    }
    Err(DecodeError::NotPrintable)
}

/// Applies [`smart_decode_text`] to every string value (not key) in a JSON tree.
pub fn repair_strings(value: &mut Value) -> Result<(), DecodeError> {
    match value {
        Value::String(s) => {
            let fixed = smart_decode_text(s)?;
            *s = fixed;
        }
        Value::Array(items) => {
            for item in items {
                repair_strings(item)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                repair_strings(v)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}
