//! Provider parse rules.
//!
//! A provider publishes three independent rule lists (ignore, metadata and
//! timeline) plus an optional profile rule. Every rule is keyed by a glob
//! matched against the archive-relative path of a leaf file: its path
//! segments after the top-level input, joined with `/`.

use std::fmt;
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use serde_json::Value;
use tessera_store::{Category, TimelineContext};

use crate::decode::repair_strings;
use crate::error::{IngestError, IngestResult};
use crate::time::EventTime;
use crate::tokenize;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled path glob. `*` stays within one segment, `**` crosses them.
#[derive(Clone)]
pub struct Glob {
    pattern: Pattern,
}

impl Glob {
    /// Compiles `pattern`.
    pub fn new(pattern: &str) -> IngestResult<Self> {
        let pattern = Pattern::new(pattern).map_err(|e| IngestError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: e.msg.to_string(),
        })?;
        Ok(Self { pattern })
    }

    /// Whether the archive-relative `path` matches.
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.pattern.as_str()).finish()
    }
}

/// Custom tokenizer: file bytes and full path to tokens.
pub type TokenizeFn = Arc<dyn Fn(&[u8], &[String]) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// How a rule turns file bytes into tokens.
#[derive(Clone)]
pub enum Tokenizer {
    /// Header row plus one object of strings per row
    Csv,
    /// A JSON array, one token per element
    Json,
    /// The whole JSON document as a single token
    JsonValue,
    /// Newline-delimited JSON, one token per line
    JsonLines,
    /// Provider-supplied
    Custom(TokenizeFn),
}

impl Tokenizer {
    /// Default tokenizer for a file name's extension, if there is one.
    pub fn for_name(name: &str) -> Option<Tokenizer> {
        let ext = name.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(Tokenizer::Csv),
            "json" => Some(Tokenizer::Json),
            "jsonl" | "ndjson" => Some(Tokenizer::JsonLines),
            _ => None,
        }
    }

    /// Runs the tokenizer. `smart` repairs double-encoded JSON string values.
    pub fn tokenize(&self, data: &[u8], path: &[String], smart: bool) -> anyhow::Result<Vec<Value>> {
        match self {
            Tokenizer::Csv => tokenize::parse_csv(data),
            Tokenizer::Json => tokenize::json_array(data, smart),
            Tokenizer::JsonValue => Ok(vec![tokenize::parse_json(data, smart)?]),
            Tokenizer::JsonLines => tokenize::parse_json_lines(data, smart),
            Tokenizer::Custom(f) => {
                let mut tokens = f(data, path)?;
                if smart {
                    for token in &mut tokens {
                        repair_strings(token)?;
                    }
                }
                Ok(tokens)
            }
        }
    }
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tokenizer::Csv => f.write_str("Csv"),
            Tokenizer::Json => f.write_str("Json"),
            Tokenizer::JsonValue => f.write_str("JsonValue"),
            Tokenizer::JsonLines => f.write_str("JsonLines"),
            Tokenizer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One parsed timeline occurrence: category, datetime and rendering hint.
pub type TimelineTuple<C> = (C, EventTime, Option<TimelineContext>);

/// Timeline parse callback. An empty vector drops the token.
pub type TimelineParseFn<C> = Arc<dyn Fn(&Value) -> anyhow::Result<Vec<TimelineTuple<C>>> + Send + Sync>;

/// Profile filter: `false` drops the token for that profile.
pub type ProfileFilterFn = Arc<dyn Fn(&Value, &str) -> bool + Send + Sync>;

/// Metadata parse callback. `None` drops the token.
pub type MetadataParseFn = Arc<dyn Fn(&Value) -> anyhow::Result<Option<(String, Value)>> + Send + Sync>;

/// Profile extraction callback: file bytes to profile names.
pub type ProfileExtractFn = Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<String>> + Send + Sync>;

/// Extracts entries for the browsable timeline.
pub struct TimelineRule<C> {
    /// Path pattern
    pub glob: Glob,
    /// Overrides the extension default
    pub tokenizer: Option<Tokenizer>,
    /// Repair double-encoded strings in tokens
    pub smart: bool,
    /// Token to tuples
    pub parse: TimelineParseFn<C>,
    /// Applied only when importing for a profile
    pub filter: Option<ProfileFilterFn>,
}

impl<C: Category> TimelineRule<C> {
    /// A rule for `glob` using the extension's default tokenizer.
    pub fn new<F>(glob: &str, parse: F) -> IngestResult<Self>
    where
        F: Fn(&Value) -> anyhow::Result<Vec<TimelineTuple<C>>> + Send + Sync + 'static,
    {
        Ok(Self {
            glob: Glob::new(glob)?,
            tokenizer: None,
            smart: false,
            parse: Arc::new(parse),
            filter: None,
        })
    }

    /// Sets the tokenizer.
    pub fn tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Turns on string repair.
    pub fn smart(mut self) -> Self {
        self.smart = true;
        self
    }

    /// Sets the profile filter.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value, &str) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl<C> Clone for TimelineRule<C> {
    fn clone(&self) -> Self {
        Self {
            glob: self.glob.clone(),
            tokenizer: self.tokenizer.clone(),
            smart: self.smart,
            parse: Arc::clone(&self.parse),
            filter: self.filter.clone(),
        }
    }
}

/// Extracts key/value metadata.
#[derive(Clone)]
pub struct MetadataRule {
    /// Path pattern
    pub glob: Glob,
    /// Overrides the extension default
    pub tokenizer: Option<Tokenizer>,
    /// Repair double-encoded strings in tokens
    pub smart: bool,
    /// Token to key/value
    pub parse: MetadataParseFn,
}

impl MetadataRule {
    /// A rule for `glob` using the extension's default tokenizer.
    pub fn new<F>(glob: &str, parse: F) -> IngestResult<Self>
    where
        F: Fn(&Value) -> anyhow::Result<Option<(String, Value)>> + Send + Sync + 'static,
    {
        Ok(Self {
            glob: Glob::new(glob)?,
            tokenizer: None,
            smart: false,
            parse: Arc::new(parse),
        })
    }

    /// Sets the tokenizer.
    pub fn tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Turns on string repair.
    pub fn smart(mut self) -> Self {
        self.smart = true;
        self
    }
}

/// Locates the file listing an export's profiles.
#[derive(Clone)]
pub struct ProfileRule {
    /// Path pattern
    pub glob: Glob,
    /// Bytes to profile names
    pub extract: ProfileExtractFn,
}

impl ProfileRule {
    /// A profile rule for `glob`.
    pub fn new<F>(glob: &str, extract: F) -> IngestResult<Self>
    where
        F: Fn(&[u8]) -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        Ok(Self {
            glob: Glob::new(glob)?,
            extract: Arc::new(extract),
        })
    }
}

/// Everything the pipeline needs to know about one provider.
pub struct ProviderRules<C> {
    /// Stable identifier, also the store's provider key
    pub slug: String,
    /// Human-readable name
    pub display_name: String,
    /// Known files that are intentionally not parsed
    pub ignore: Vec<Glob>,
    /// Metadata rules, first match wins
    pub metadata: Vec<MetadataRule>,
    /// Timeline rules, first match wins
    pub timeline: Vec<TimelineRule<C>>,
    /// Where profile names live, if the export has profiles
    pub profile: Option<ProfileRule>,
}

impl<C: Category> ProviderRules<C> {
    /// An empty rule set.
    pub fn new(slug: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            display_name: display_name.into(),
            ignore: Vec::new(),
            metadata: Vec::new(),
            timeline: Vec::new(),
            profile: None,
        }
    }

    /// Adds an ignore glob.
    pub fn ignore(mut self, glob: &str) -> IngestResult<Self> {
        self.ignore.push(Glob::new(glob)?);
        Ok(self)
    }

    /// Adds a metadata rule.
    pub fn metadata(mut self, rule: MetadataRule) -> Self {
        self.metadata.push(rule);
        self
    }

    /// Adds a timeline rule.
    pub fn timeline(mut self, rule: TimelineRule<C>) -> Self {
        self.timeline.push(rule);
        self
    }

    /// Sets the profile rule.
    pub fn profile(mut self, rule: ProfileRule) -> Self {
        self.profile = Some(rule);
        self
    }

    /// First timeline rule matching `path`.
    pub fn timeline_rule(&self, path: &str) -> Option<&TimelineRule<C>> {
        self.timeline.iter().find(|r| r.glob.matches(path))
    }

    /// First metadata rule matching `path`.
    pub fn metadata_rule(&self, path: &str) -> Option<&MetadataRule> {
        self.metadata.iter().find(|r| r.glob.matches(path))
    }

    /// Whether an ignore glob matches `path`.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore.iter().any(|g| g.matches(path))
    }
}

impl<C> fmt::Debug for ProviderRules<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRules")
            .field("slug", &self.slug)
            .field("ignore", &self.ignore)
            .field("metadata", &self.metadata.len())
            .field("timeline", &self.timeline.len())
            .field("profile", &self.profile.as_ref().map(|p| p.glob.as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Kind;
    use serde_json::json;

    #[test]
    fn test_glob_segments() {
        let g = Glob::new("activity/*.json").unwrap();
        assert!(g.matches("activity/a.json"));
        assert!(!g.matches("activity/2021/a.json"));
        assert!(!g.matches("Activity/a.json"));

        let deep = Glob::new("**/*.csv").unwrap();
        assert!(deep.matches("x/y/z.csv"));
        assert!(Glob::new("*").unwrap().matches(".hidden"));
    }

    #[test]
    fn test_invalid_glob() {
        match Glob::new("a/[b") {
            Err(IngestError::InvalidGlob { pattern, .. }) => assert_eq!(pattern, "a/[b"),
            other => panic!("unexpected {:?}", other.map(|g| g.as_str().to_string())),
        }
    }

    #[test]
    fn test_default_tokenizer_by_extension() {
        assert!(matches!(Tokenizer::for_name("a.CSV"), Some(Tokenizer::Csv)));
        assert!(matches!(Tokenizer::for_name("a.json"), Some(Tokenizer::Json)));
        assert!(matches!(Tokenizer::for_name("a.ndjson"), Some(Tokenizer::JsonLines)));
        assert!(Tokenizer::for_name("a.txt").is_none());
        assert!(Tokenizer::for_name("README").is_none());
    }

    #[test]
    fn test_custom_tokenizer_sees_path() {
        let t = Tokenizer::Custom(Arc::new(|data: &[u8], path: &[String]| -> anyhow::Result<Vec<Value>> {
            Ok(vec![json!({"len": data.len(), "name": path.last()})])
        }));
        let tokens = t.tokenize(b"abc", &["x.zip".into(), "f.bin".into()], false).unwrap();
        assert_eq!(tokens, vec![json!({"len": 3, "name": "f.bin"})]);
    }

    #[test]
    fn test_custom_tokenizer_smart_repair() {
        let t = Tokenizer::Custom(Arc::new(|_: &[u8], _: &[String]| -> anyhow::Result<Vec<Value>> {
            Ok(vec![json!({"name": ["CafÃ©"], "n": 1})])
        }));
        assert_eq!(
            t.tokenize(b"", &[], false).unwrap(),
            vec![json!({"name": ["CafÃ©"], "n": 1})]
        );
        assert_eq!(
            t.tokenize(b"", &[], true).unwrap(),
            vec![json!({"name": ["Café"], "n": 1})]
        );
    }

    #[test]
    fn test_first_match_wins() {
        let rules = ProviderRules::<Kind>::new("acme", "Acme")
            .timeline(TimelineRule::new("a/*.json", |_| Ok(vec![])).unwrap().smart())
            .timeline(TimelineRule::new("**/*.json", |_| Ok(vec![])).unwrap())
            .ignore("junk/**/*")
            .unwrap();
        assert!(rules.timeline_rule("a/x.json").unwrap().smart);
        assert!(!rules.timeline_rule("b/x.json").unwrap().smart);
        assert!(rules.metadata_rule("a/x.json").is_none());
        assert!(rules.is_ignored("junk/deep/file"));
        assert!(!rules.is_ignored("a/x.json"));
    }
}
