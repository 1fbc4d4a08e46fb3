//! Per-file dispatch: classify a leaf and run its matching rules.
//!
//! Each matched rule runs tokenize, parse and transform with errors captured
//! per token, so one bad record never aborts its siblings or the import.

use serde_json::Value;
use tessera_store::{
    timeline_slug, Category, FileStatus, ParseError, ParseStage, TimelineContext, TimelineEntry,
    TimelineEntryKey,
};
use tracing::debug;

use crate::decode::smart_decode;
use crate::rules::{ProviderRules, Tokenizer};
use crate::time::EventTime;
use crate::tokenize;

/// Files above this size are never considered empty.
pub const EMPTY_CHECK_LIMIT: usize = 16 * 1024;

/// What one leaf file produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome<C> {
    /// Classification
    pub status: FileStatus,
    /// Timeline entries in token order
    pub timeline: Vec<TimelineEntry<C>>,
    /// Metadata pairs in token order
    pub metadata: Vec<(String, Value)>,
    /// Captured stage errors
    pub errors: Vec<ParseError>,
}

impl<C> ParseOutcome<C> {
    fn new(status: FileStatus) -> Self {
        Self {
            status,
            timeline: Vec::new(),
            metadata: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Archive-relative path used for rule matching: segments after the
/// top-level input, joined with `/`.
pub fn rule_path(path: &[String]) -> String {
    path.get(1..).unwrap_or_default().join("/")
}

fn stage_error(stage: ParseStage, err: &anyhow::Error, token: Option<&Value>) -> ParseError {
    ParseError {
        stage,
        message: format!("{:#}", err),
        line: token.map(Value::to_string),
    }
}

fn tokenize_with(
    tokenizer: Option<&Tokenizer>,
    path: &[String],
    data: &[u8],
    smart: bool,
) -> anyhow::Result<Vec<Value>> {
    let name = path.last().map(String::as_str).unwrap_or("");
    match tokenizer {
        Some(t) => t.tokenize(data, path, smart),
        None => match Tokenizer::for_name(name) {
            Some(t) => t.tokenize(data, path, smart),
            None => {
                let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("unknown");
                anyhow::bail!("no default tokenizer for .{}", ext)
            }
        },
    }
}

fn transform<C: Category>(
    path: &[String],
    token: &Value,
    category: C,
    time: &EventTime,
    context: Option<TimelineContext>,
) -> anyhow::Result<TimelineEntry<C>> {
    let timestamp = time.timestamp().map_err(anyhow::Error::msg)?;
    if !timestamp.is_finite() {
        anyhow::bail!("timestamp is not a finite number");
    }
    let day = time.day().map_err(anyhow::Error::msg)?;
    let slug = timeline_slug(timestamp, token)?;
    Ok(TimelineEntry {
        key: TimelineEntryKey {
            day,
            timestamp,
            slug,
            category,
            payload: None,
            offset: None,
        },
        file: path.to_vec(),
        context,
        value: token.clone(),
    })
}

/// Classifies `data` at `path` and extracts what its matching rules describe.
/// With a `profile`, timeline tokens rejected by the rule's filter are dropped.
pub fn parse_file<C: Category>(
    rules: &ProviderRules<C>,
    profile: Option<&str>,
    path: &[String],
    data: &[u8],
) -> ParseOutcome<C> {
    let matched = rule_path(path);
    let metadata_rule = rules.metadata_rule(&matched);
    let timeline_rule = rules.timeline_rule(&matched);
    let mut out = ParseOutcome::new(FileStatus::Unknown);

    if let Some(rule) = metadata_rule {
        out.status = FileStatus::Parsed;
        match tokenize_with(rule.tokenizer.as_ref(), path, data, rule.smart) {
            Ok(tokens) => {
                for token in &tokens {
                    match (rule.parse)(token) {
                        Ok(Some(pair)) => out.metadata.push(pair),
                        Ok(None) => {}
                        Err(e) => out.errors.push(stage_error(ParseStage::Parse, &e, Some(token))),
                    }
                }
            }
            Err(e) => out.errors.push(stage_error(ParseStage::Tokenize, &e, None)),
        }
    }

    if let Some(rule) = timeline_rule {
        out.status = FileStatus::Parsed;
        match tokenize_with(rule.tokenizer.as_ref(), path, data, rule.smart) {
            Ok(tokens) => {
                for token in &tokens {
                    if let (Some(profile), Some(filter)) = (profile, rule.filter.as_ref()) {
                        if !filter(token, profile) {
                            continue;
                        }
                    }
                    let tuples = match (rule.parse)(token) {
                        Ok(tuples) => tuples,
                        Err(e) => {
                            out.errors.push(stage_error(ParseStage::Parse, &e, Some(token)));
                            continue;
                        }
                    };
                    for (category, time, context) in tuples {
                        match transform(path, token, category, &time, context) {
                            Ok(entry) => out.timeline.push(entry),
                            Err(e) => out
                                .errors
                                .push(stage_error(ParseStage::Transform, &e, Some(token))),
                        }
                    }
                }
            }
            Err(e) => out.errors.push(stage_error(ParseStage::Tokenize, &e, None)),
        }
    }

    if out.status == FileStatus::Unknown {
        if rules.is_ignored(&matched) {
            out.status = FileStatus::Skipped;
        } else if is_empty_file(data) {
            out.status = FileStatus::Empty;
        }
    }

    for err in &out.errors {
        debug!(path = %path.join("/"), stage = %err.stage, message = %err.message, "parse error");
    }
    out
}

/// Whitespace only, a JSON document of nothing but empty containers, or a
/// CSV table without data rows. Large files are never empty.
pub fn is_empty_file(data: &[u8]) -> bool {
    if data.len() > EMPTY_CHECK_LIMIT {
        return false;
    }
    if String::from_utf8_lossy(data).trim().is_empty() {
        return true;
    }
    if let Ok(value) = tokenize::parse_json(data, false) {
        if tokenize::is_all_empty(&value) {
            return true;
        }
    }
    if smart_decode(data).is_ok() {
        if let Ok(rows) = tokenize::parse_csv(data) {
            return rows.is_empty();
        }
    }
    false
}
