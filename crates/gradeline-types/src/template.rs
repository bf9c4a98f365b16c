use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::check::CheckEntry;
use super::error::{GradelineError, Result};

/// Placeholder that is always resolvable: the recipient's seed token.
pub const SEED_PLACEHOLDER: &str = "seed";

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// A parametrizable assignment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Defaults to the number of declared rounds.
    #[serde(default)]
    pub max_rounds: Option<u8>,
    pub rounds: Vec<RoundDefinition>,
}

/// Brief, value sources, attachments and checks for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundDefinition {
    pub round: u8,
    pub brief: String,
    #[serde(default)]
    pub placeholders: BTreeMap<String, PlaceholderSource>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
}

/// Where a placeholder's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PlaceholderSource {
    /// Ordered candidate values; one is picked from the seed.
    Choices { values: Vec<String> },
    /// Hex token derived from the seed.
    SeedToken { length: usize },
    /// Integer in `min..=max` derived from the seed.
    Integer { min: i64, max: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub name: String,
    pub media_type: String,
    pub content: AttachmentContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentContent {
    /// Literal text; may reference placeholders.
    Inline { text: String },
    /// Seeded CSV of product sales with `rows` data rows.
    SalesCsv { rows: usize },
}

impl Template {
    pub fn max_rounds(&self) -> u8 {
        self.max_rounds
            .unwrap_or_else(|| u8::try_from(self.rounds.len()).unwrap_or(u8::MAX))
    }

    pub fn round(&self, round: u8) -> Option<&RoundDefinition> {
        self.rounds.iter().find(|r| r.round == round)
    }

    /// Every placeholder referenced in a round must have a value source in that round.
    pub fn validate(&self) -> Result<()> {
        for round in &self.rounds {
            if let Some(placeholder) = round.unresolved_placeholders().into_iter().next() {
                return Err(GradelineError::MissingResolution {
                    template_id: self.id.clone(),
                    round: round.round,
                    placeholder,
                });
            }
            if let Some((name, _)) = round.placeholders.iter().find(|(_, s)| !s.is_usable()) {
                return Err(GradelineError::MissingResolution {
                    template_id: self.id.clone(),
                    round: round.round,
                    placeholder: name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl PlaceholderSource {
    /// An empty choice list or an inverted range cannot produce a value.
    pub fn is_usable(&self) -> bool {
        match self {
            PlaceholderSource::Choices { values } => !values.is_empty(),
            PlaceholderSource::SeedToken { length } => *length > 0 && *length <= 64,
            PlaceholderSource::Integer { min, max } => min <= max,
        }
    }
}

impl RoundDefinition {
    /// Placeholder names referenced by the brief, inline attachments, and checks.
    pub fn referenced_placeholders(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = placeholder_names(&self.brief).collect();
        for attachment in &self.attachments {
            names.extend(placeholder_names(&attachment.name));
            if let AttachmentContent::Inline { text } = &attachment.content {
                names.extend(placeholder_names(text));
            }
        }
        for entry in &self.checks {
            names.extend(placeholder_names(&entry.label));
            if let Ok(value) = serde_json::to_value(&entry.check) {
                let mut strings = Vec::new();
                collect_strings(&value, &mut strings);
                for s in strings {
                    names.extend(placeholder_names(s));
                }
            }
        }
        names
    }

    pub fn unresolved_placeholders(&self) -> Vec<String> {
        self.referenced_placeholders()
            .into_iter()
            .filter(|name| name != SEED_PLACEHOLDER && !self.placeholders.contains_key(name))
            .collect()
    }
}

/// Names of `{{name}}` placeholders in `text`, in order of appearance.
pub fn placeholder_names(text: &str) -> impl Iterator<Item = String> + '_ {
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
}

/// Replace every placeholder in `text`. Fails with the first name that has no value.
pub fn substitute(
    text: &str,
    values: &BTreeMap<String, String>,
) -> std::result::Result<String, String> {
    if let Some(missing) = placeholder_names(text).find(|name| !values.contains_key(name)) {
        return Err(missing);
    }
    Ok(PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// Collect every string leaf of a JSON value.
pub fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
