use serde::{Deserialize, Serialize};

/// One declared check on a template round, with its aggregation weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub label: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub check: CheckDescriptor,
}

fn default_weight() -> f64 {
    1.0
}

impl CheckEntry {
    pub fn new(label: impl Into<String>, check: CheckDescriptor) -> Self {
        Self {
            label: label.into(),
            weight: default_weight(),
            check,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }
}

/// Shape of a check as declared in a template.
///
/// A bare string is a free-form boolean expression evaluated against the live
/// document. An object tagged with `type` is a named check. Anything else is
/// kept verbatim so newer template vocabularies survive older evaluators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckDescriptor {
    Expression(String),
    Named(NamedCheck),
    Unrecognized(serde_json::Value),
}

/// Named check vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NamedCheck {
    /// Repository carries a license file, optionally of a given SPDX id.
    LicensePresent {
        #[serde(default)]
        expected: Option<String>,
    },
    /// Repository was created after the task was issued and within `hours` of it.
    CreatedWithin { hours: u32 },
    FileExists { path: String },
    /// A file of the artifact judged against a rubric.
    ContentQuality { path: String, rubric: String },
    TitleMatches { pattern: String },
    ElementExists { selector: String },
    TextMatches { selector: String, pattern: String },
    AttributePresent {
        selector: String,
        attribute: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Click `selector`, then evaluate `expression` as the post-condition.
    ClickThen { selector: String, expression: String },
}

/// Check families, each with its own capability and failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFamily {
    Static,
    ContentQuality,
    Dynamic,
}

impl NamedCheck {
    pub fn family(&self) -> CheckFamily {
        match self {
            NamedCheck::LicensePresent { .. }
            | NamedCheck::CreatedWithin { .. }
            | NamedCheck::FileExists { .. } => CheckFamily::Static,
            NamedCheck::ContentQuality { .. } => CheckFamily::ContentQuality,
            NamedCheck::TitleMatches { .. }
            | NamedCheck::ElementExists { .. }
            | NamedCheck::TextMatches { .. }
            | NamedCheck::AttributePresent { .. }
            | NamedCheck::ClickThen { .. } => CheckFamily::Dynamic,
        }
    }
}

impl CheckDescriptor {
    /// `None` for unrecognized shapes.
    pub fn family(&self) -> Option<CheckFamily> {
        match self {
            CheckDescriptor::Expression(_) => Some(CheckFamily::Dynamic),
            CheckDescriptor::Named(named) => Some(named.family()),
            CheckDescriptor::Unrecognized(_) => None,
        }
    }

    pub fn needs_browser(&self) -> bool {
        self.family() == Some(CheckFamily::Dynamic)
    }
}
