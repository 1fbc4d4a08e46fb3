//! Bytes to tokens: the built-in JSON, JSON-lines and CSV tokenizers.

use anyhow::{bail, Context};
use serde_json::{Map, Value};

use crate::decode::{decode_utf16be, repair_strings, smart_decode};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

fn strip_utf8_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(UTF8_BOM).unwrap_or(data)
}

/// Parses a JSON document. Input that isn't valid UTF-8 JSON is retried as
/// UTF-16BE. With `smart`, every string value is run through the
/// double-encoding repair.
pub fn parse_json(data: &[u8], smart: bool) -> anyhow::Result<Value> {
    let mut value = match serde_json::from_slice::<Value>(strip_utf8_bom(data)) {
        Ok(v) => v,
        Err(utf8_err) => match decode_utf16be(data) {
            Some(text) => serde_json::from_str(text.trim_start_matches('\u{feff}'))
                .map_err(|_| utf8_err)
                .context("invalid JSON")?,
            None => return Err(utf8_err).context("invalid JSON"),
        },
    };
    if smart {
        repair_strings(&mut value)?;
    }
    Ok(value)
}

/// Parses newline-delimited JSON, skipping blank lines.
pub fn parse_json_lines(data: &[u8], smart: bool) -> anyhow::Result<Vec<Value>> {
    let text = String::from_utf8_lossy(strip_utf8_bom(data));
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            parse_json(line.as_bytes(), smart).with_context(|| format!("line {}", i + 1))
        })
        .collect()
}

/// Parses a CSV table with a header row into one JSON object per row, all
/// values strings. Fields past the header are named `field{n}`.
pub fn parse_csv(data: &[u8]) -> anyhow::Result<Vec<Value>> {
    let text = smart_decode(strip_utf8_bom(data))?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers().context("invalid CSV header")?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("invalid CSV row")?;
        let mut row = Map::new();
        for (i, field) in record.iter().enumerate() {
            let name = match headers.get(i) {
                Some(h) => h.to_string(),
                None => format!("field{}", i + 1),
            };
            row.insert(name, Value::String(field.to_string()));
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

/// Tokenizes `data` with the JSON tokenizer: the document must be an array.
pub fn json_array(data: &[u8], smart: bool) -> anyhow::Result<Vec<Value>> {
    match parse_json(data, smart)? {
        Value::Array(items) => Ok(items),
        other => bail!("expected a JSON array, got {}", json_kind(&other)),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// True for arrays and objects whose leaves are all empty containers.
/// Primitives, `null` included, count as content.
pub fn is_all_empty(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_all_empty),
        Value::Object(map) => map.values().all(is_all_empty),
        _ => false,
    }
}
