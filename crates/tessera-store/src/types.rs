//! Record and index types shared by the read and write paths.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::file_slug;

/// Provider slug to the record id of that provider's current [`ProviderIndex`].
pub type RootIndex = BTreeMap<String, String>;

/// Provider-defined timeline category.
///
/// Categories are stored in index rows as opaque string tags; each provider
/// supplies its own enum and the mapping to and from tags.
pub trait Category: Clone + Eq + Debug + Send + Sync + 'static {
    /// Tag stored in the index.
    fn as_tag(&self) -> &str;
    /// Inverse of [`Category::as_tag`]; `None` for tags this provider doesn't know.
    fn from_tag(tag: &str) -> Option<Self>;
}

/// Outcome of classifying a leaf file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// A metadata or timeline rule matched.
    Parsed,
    /// An ignore rule matched.
    Skipped,
    /// Whitespace only, an empty JSON structure or a zero-row CSV.
    Empty,
    /// Nothing matched and the content isn't empty.
    Unknown,
}

/// Why a file's bytes were not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// Larger than the configured size ceiling.
    #[serde(rename = "tooLarge")]
    TooLarge,
}

/// Pipeline stage a parse error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStage {
    /// Bytes to tokens
    Tokenize,
    /// Token to tuples
    Parse,
    /// Tuple to committed entry
    Transform,
}

impl std::fmt::Display for ParseStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseStage::Tokenize => "tokenize",
            ParseStage::Parse => "parse",
            ParseStage::Transform => "transform",
        };
        f.write_str(s)
    }
}

/// A captured failure from one stage for one token of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// Stage that failed
    pub stage: ParseStage,
    /// Error message
    pub message: String,
    /// The offending token, if there was one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

/// Index entry for one leaf file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileKey {
    /// Provider slug
    pub provider: String,
    /// Path segments, outermost archive first
    pub path: Vec<String>,
    /// Hash of the joined path
    pub slug: String,
    /// Set when the bytes were never stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    /// Record id of the encrypted payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Classification, absent for size-limited files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
    /// Parse errors captured for this file
    #[serde(default)]
    pub errors: Vec<ParseError>,
}

impl DataFileKey {
    /// A key for `path` with its slug computed and nothing else set.
    pub fn new(provider: impl Into<String>, path: Vec<String>) -> Self {
        let slug = file_slug(&path);
        Self {
            provider: provider.into(),
            path,
            slug,
            skipped: None,
            payload: None,
            status: None,
            errors: Vec::new(),
        }
    }

    /// Path segments joined with `/`.
    pub fn joined_path(&self) -> String {
        self.path.join("/")
    }

    /// Last path segment.
    pub fn file_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }
}

/// A file key together with its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    /// Index entry
    pub key: DataFileKey,
    /// Raw bytes (empty for skipped files)
    pub data: Vec<u8>,
}

/// Author shown next to a timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineUser {
    /// Display name
    pub display: String,
    /// Optional CSS-style colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Small rendering hint: a title, an optional detail line and an optional user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineContext {
    /// Headline
    pub title: String,
    /// Secondary line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<TimelineUser>,
}

impl TimelineContext {
    /// A context with just a title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
            user: None,
        }
    }
}

/// Index-level view of a timeline entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntryKey<C> {
    /// ISO date, for grouping
    pub day: String,
    /// Seconds since the epoch, for ordering
    pub timestamp: f64,
    /// Dedup and sort key
    pub slug: String,
    /// Provider category
    pub category: C,
    /// Record id of the batch payload holding this entry
    pub payload: Option<String>,
    /// Position inside the batch payload
    pub offset: Option<usize>,
}

/// A fully hydrated timeline entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry<C> {
    /// Index-level fields
    pub key: TimelineEntryKey<C>,
    /// Provenance path
    pub file: Vec<String>,
    /// Rendering hint
    pub context: Option<TimelineContext>,
    /// Raw parsed token
    pub value: Value,
}

/// One slot of a batched timeline payload record.
pub type TimelineSlot = (Vec<String>, Option<TimelineContext>, Value);

/// Compact timeline row stored in a [`ProviderIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineRow {
    /// Batch payload record id
    pub payload: String,
    /// Position inside the batch
    pub offset: usize,
    /// ISO date
    pub day: String,
    /// Seconds since the epoch
    pub timestamp: f64,
    /// Dedup and sort key
    pub slug: String,
    /// Category tag
    pub category: String,
}

impl TimelineRow {
    /// Typed key for this row, or `None` if the tag is unknown to `C`.
    pub fn to_key<C: Category>(&self) -> Option<TimelineEntryKey<C>> {
        Some(TimelineEntryKey {
            day: self.day.clone(),
            timestamp: self.timestamp,
            slug: self.slug.clone(),
            category: C::from_tag(&self.category)?,
            payload: Some(self.payload.clone()),
            offset: Some(self.offset),
        })
    }
}

/// Immutable per-provider summary of one import.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderIndex {
    /// Files sorted by joined path
    pub files: Vec<DataFileKey>,
    /// Metadata sorted by key
    pub metadata: Vec<(String, Value)>,
    /// Timeline rows sorted by slug
    pub timeline: Vec<TimelineRow>,
    /// True if any file carries parse errors
    pub has_errors: bool,
}

impl ProviderIndex {
    /// Every payload record id this index references.
    pub fn payload_ids(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter_map(|f| f.payload.as_deref())
            .chain(self.timeline.iter().map(|r| r.payload.as_str()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Category;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Kind {
        Activity,
        Message,
    }

    impl Category for Kind {
        fn as_tag(&self) -> &str {
            match self {
                Kind::Activity => "activity",
                Kind::Message => "message",
            }
        }

        fn from_tag(tag: &str) -> Option<Self> {
            match tag {
                "activity" => Some(Kind::Activity),
                "message" => Some(Kind::Message),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Kind;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_file_key_wire_names() {
        let mut key = DataFileKey::new("acme", vec!["x.zip".into(), "big.bin".into()]);
        key.skipped = Some(SkipReason::TooLarge);
        let v = serde_json::to_value(&key).unwrap();
        assert_eq!(v["skipped"], json!("tooLarge"));
        assert!(v.get("status").is_none());
        assert!(v.get("payload").is_none());

        key.skipped = None;
        key.status = Some(FileStatus::Parsed);
        let v = serde_json::to_value(&key).unwrap();
        assert_eq!(v["status"], json!("parsed"));
    }

    #[test]
    fn test_joined_path_and_name() {
        let key = DataFileKey::new("acme", vec!["x.zip".into(), "dir".into(), "a.json".into()]);
        assert_eq!(key.joined_path(), "x.zip/dir/a.json");
        assert_eq!(key.file_name(), "a.json");
        assert_eq!(key.slug.len(), 16);
    }

    #[test]
    fn test_row_to_key() {
        let row = TimelineRow {
            payload: "abc".into(),
            offset: 3,
            day: "2021-05-01".into(),
            timestamp: 1.5,
            slug: "0000000100000000".into(),
            category: "message".into(),
        };
        let key = row.to_key::<Kind>().unwrap();
        assert_eq!(key.category, Kind::Message);
        assert_eq!(key.offset, Some(3));

        let unknown = TimelineRow {
            category: "nope".into(),
            ..row
        };
        assert!(unknown.to_key::<Kind>().is_none());
    }

    #[test]
    fn test_index_payload_ids() {
        let mut f = DataFileKey::new("acme", vec!["a".into()]);
        f.payload = Some("p1".into());
        let skipped = DataFileKey::new("acme", vec!["b".into()]);
        let index = ProviderIndex {
            files: vec![f, skipped],
            metadata: vec![],
            timeline: vec![TimelineRow {
                payload: "t1".into(),
                offset: 0,
                day: "1970-01-01".into(),
                timestamp: 0.0,
                slug: "00".into(),
                category: "activity".into(),
            }],
            has_errors: false,
        };
        let ids: Vec<_> = index.payload_ids().collect();
        assert_eq!(ids, vec!["p1", "t1"]);
        assert!(serde_json::to_value(&index).unwrap().get("hasErrors").is_some());
    }

    #[test]
    fn test_parse_error_line_is_optional() {
        let e: ParseError =
            serde_json::from_value(json!({"stage": "transform", "message": "bad"})).unwrap();
        assert_eq!(e.stage, ParseStage::Transform);
        assert_eq!(e.line, None);
        assert_eq!(e.stage.to_string(), "transform");
    }
}
