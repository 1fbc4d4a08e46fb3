//! Declarative providers described in configuration rather than code.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_store::{Category, TimelineContext};

use crate::error::{IngestError, IngestResult};
use crate::rules::{MetadataRule, ProfileRule, ProviderRules, TimelineRule, Tokenizer};
use crate::time::EventTime;
use crate::tokenize;

/// Category of a configured provider: the tag itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfiguredCategory(pub String);

impl Category for ConfiguredCategory {
    fn as_tag(&self) -> &str {
        &self.0
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(ConfiguredCategory(tag.to_string()))
    }
}

/// Built-in tokenizer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerSpec {
    /// Header row plus rows
    Csv,
    /// JSON array
    Json,
    /// Whole JSON document
    JsonValue,
    /// Newline-delimited JSON
    JsonLines,
}

impl From<TokenizerSpec> for Tokenizer {
    fn from(spec: TokenizerSpec) -> Self {
        match spec {
            TokenizerSpec::Csv => Tokenizer::Csv,
            TokenizerSpec::Json => Tokenizer::Json,
            TokenizerSpec::JsonValue => Tokenizer::JsonValue,
            TokenizerSpec::JsonLines => Tokenizer::JsonLines,
        }
    }
}

/// How a timeline rule reads its time field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TimeFormat {
    /// RFC 3339 with offset
    #[default]
    Rfc3339,
    /// `YYYY-MM-DD HH:MM:SS` UTC
    Sql,
    /// Seconds since the epoch
    Unix,
    /// Milliseconds since the epoch
    UnixMillis,
    /// A `strftime` pattern
    Pattern(String),
}

impl From<String> for TimeFormat {
    fn from(s: String) -> Self {
        match s.as_str() {
            "rfc3339" => TimeFormat::Rfc3339,
            "sql" => TimeFormat::Sql,
            "unix" => TimeFormat::Unix,
            "unix_ms" => TimeFormat::UnixMillis,
            _ => TimeFormat::Pattern(s),
        }
    }
}

impl From<TimeFormat> for String {
    fn from(f: TimeFormat) -> Self {
        match f {
            TimeFormat::Rfc3339 => "rfc3339".into(),
            TimeFormat::Sql => "sql".into(),
            TimeFormat::Unix => "unix".into(),
            TimeFormat::UnixMillis => "unix_ms".into(),
            TimeFormat::Pattern(p) => p,
        }
    }
}

impl TimeFormat {
    /// Reads `value` as a datetime in this format. Numbers and numeric
    /// strings are both accepted for the epoch formats.
    pub fn read(&self, value: Option<&Value>) -> EventTime {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return EventTime::Invalid("missing time field".into());
        };
        let text = scalar_text(value);
        let number = value
            .as_f64()
            .or_else(|| text.as_deref().and_then(|t| t.trim().parse().ok()));
        let not_number = || EventTime::Invalid(format!("not a number: {}", value));
        let not_text = || EventTime::Invalid(format!("not a string: {}", value));
        match self {
            TimeFormat::Unix => number.map_or_else(not_number, EventTime::from_unix_seconds),
            TimeFormat::UnixMillis => number.map_or_else(not_number, EventTime::from_unix_millis),
            TimeFormat::Rfc3339 => text.map_or_else(not_text, |t| EventTime::from_rfc3339(&t)),
            TimeFormat::Sql => text.map_or_else(not_text, |t| EventTime::from_sql(&t)),
            TimeFormat::Pattern(p) => text.map_or_else(not_text, |t| EventTime::from_format(&t, p)),
        }
    }
}

/// Looks up a dotted field path; numeric segments index arrays.
pub fn field<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |v, seg| match v {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Replaces `{field}` placeholders with the token's field values. Missing
/// fields render empty; unmatched braces are kept.
pub fn render_template(template: &str, token: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else { break };
        out.push_str(&rest[..open]);
        let name = &rest[open + 1..open + close];
        if let Some(text) = field(token, name).and_then(scalar_text) {
            out.push_str(&text);
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

/// Key/value extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSpec {
    /// Path pattern
    pub glob: String,
    /// Literal key; the whole token is the value unless `value_field` is set
    #[serde(default)]
    pub key: Option<String>,
    /// Field holding the key
    #[serde(default)]
    pub key_field: Option<String>,
    /// Field holding the value
    #[serde(default)]
    pub value_field: Option<String>,
    /// Overrides the extension default
    #[serde(default)]
    pub tokenizer: Option<TokenizerSpec>,
    /// Repair double-encoded strings
    #[serde(default)]
    pub smart: bool,
}

/// Timeline extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSpec {
    /// Path pattern
    pub glob: String,
    /// Category tag; must be declared in the provider's categories
    pub category: String,
    /// Field holding the event time
    pub time_field: String,
    /// How to read it
    #[serde(default)]
    pub time_format: TimeFormat,
    /// Title template
    pub title: String,
    /// Field shown as the detail line
    #[serde(default)]
    pub detail_field: Option<String>,
    /// Field compared with the selected profile
    #[serde(default)]
    pub profile_field: Option<String>,
    /// Overrides the extension default
    #[serde(default)]
    pub tokenizer: Option<TokenizerSpec>,
    /// Repair double-encoded strings
    #[serde(default)]
    pub smart: bool,
}

/// Where profile names live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Path pattern
    pub glob: String,
    /// Field holding each profile name
    pub field: String,
}

/// A provider described in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Store key and CLI name
    pub slug: String,
    /// Human-readable name, defaults to the slug
    #[serde(default)]
    pub display_name: Option<String>,
    /// Declared category tags
    #[serde(default)]
    pub categories: Vec<String>,
    /// Ignore globs
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Profile rule
    #[serde(default)]
    pub profile: Option<ProfileSpec>,
    /// Metadata rules
    #[serde(default)]
    pub metadata: Vec<MetadataSpec>,
    /// Timeline rules
    #[serde(default)]
    pub timeline: Vec<TimelineSpec>,
}

impl ProviderSpec {
    fn invalid(&self, reason: impl Into<String>) -> IngestError {
        IngestError::InvalidProviderSpec {
            slug: self.slug.clone(),
            reason: reason.into(),
        }
    }

    /// Compiles these settings into rules, validating globs and category tags.
    pub fn compile(&self) -> IngestResult<ProviderRules<ConfiguredCategory>> {
        if self.slug.trim().is_empty() {
            return Err(self.invalid("empty slug"));
        }
        let declared: BTreeSet<&str> = self.categories.iter().map(String::as_str).collect();
        let display = self.display_name.clone().unwrap_or_else(|| self.slug.clone());
        let mut rules = ProviderRules::new(self.slug.clone(), display);

        for glob in &self.ignore {
            rules = rules.ignore(glob)?;
        }
        for spec in &self.metadata {
            rules = rules.metadata(self.compile_metadata(spec)?);
        }
        for spec in &self.timeline {
            if !declared.contains(spec.category.as_str()) {
                return Err(self.invalid(format!("undeclared category {:?}", spec.category)));
            }
            rules = rules.timeline(compile_timeline(spec)?);
        }
        if let Some(profile) = &self.profile {
            let name = profile.field.clone();
            rules = rules.profile(ProfileRule::new(&profile.glob, move |data| {
                let tokens = match tokenize::parse_json(data, false) {
                    Ok(Value::Array(items)) => items,
                    Ok(other) => vec![other],
                    Err(_) => tokenize::parse_csv(data)?,
                };
                Ok(tokens
                    .iter()
                    .filter_map(|t| field(t, &name).and_then(scalar_text))
                    .collect())
            })?);
        }
        Ok(rules)
    }

    fn compile_metadata(&self, spec: &MetadataSpec) -> IngestResult<MetadataRule> {
        let key = spec.key.clone();
        let key_field = spec.key_field.clone();
        let value_field = spec.value_field.clone();
        if key.is_none() && key_field.is_none() {
            return Err(self.invalid(format!("metadata rule {:?} needs key or key_field", spec.glob)));
        }
        let mut rule = MetadataRule::new(&spec.glob, move |token| {
            let k = match (&key, &key_field) {
                (Some(k), _) => k.clone(),
                (None, Some(f)) => field(token, f)
                    .and_then(scalar_text)
                    .ok_or_else(|| anyhow::anyhow!("missing key field {:?}", f))?,
                (None, None) => anyhow::bail!("no key"),
            };
            let v = match &value_field {
                Some(f) => field(token, f)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("missing value field {:?}", f))?,
                None => token.clone(),
            };
            Ok(Some((k, v)))
        })?;
        if let Some(t) = spec.tokenizer {
            rule = rule.tokenizer(t.into());
        }
        if spec.smart {
            rule = rule.smart();
        }
        Ok(rule)
    }
}

fn compile_timeline(spec: &TimelineSpec) -> IngestResult<TimelineRule<ConfiguredCategory>> {
    let category = ConfiguredCategory(spec.category.clone());
    let time_field = spec.time_field.clone();
    let format = spec.time_format.clone();
    let title = spec.title.clone();
    let detail_field = spec.detail_field.clone();
    let mut rule = TimelineRule::new(&spec.glob, move |token| {
        let time = format.read(field(token, &time_field));
        let context = TimelineContext {
            title: render_template(&title, token),
            detail: detail_field
                .as_deref()
                .and_then(|f| field(token, f))
                .and_then(scalar_text),
            user: None,
        };
        Ok(vec![(category.clone(), time, Some(context))])
    })?;
    if let Some(t) = spec.tokenizer {
        rule = rule.tokenizer(t.into());
    }
    if spec.smart {
        rule = rule.smart();
    }
    if let Some(pf) = spec.profile_field.clone() {
        rule = rule.filter(move |token, profile| {
            field(token, &pf).and_then(scalar_text).as_deref() == Some(profile)
        });
    }
    Ok(rule)
}
