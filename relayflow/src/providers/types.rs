//! Submission input and provider payload types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{RelayError, Result};

/// Longest accepted title, in characters.
pub const MAX_TITLE_CHARS: usize = 200;

/// Longest accepted description, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 10_000;

/// A raw submission as received at intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionInput {
    /// Short summary line.
    pub title: String,
    /// Free-text body. May be empty.
    #[serde(default)]
    pub description: String,
    /// Reporter-chosen severity, e.g. "critical" or "low".
    pub severity: String,
    /// Reporter-chosen category, e.g. "security".
    pub category: String,
    /// Optional reporter contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
}

impl SubmissionInput {
    /// Creates an input with the required fields.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        severity: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            severity: severity.into(),
            category: category.into(),
            reporter: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: impl Into<String>) -> Self {
        self.reporter = Some(reporter.into());
        self
    }

    /// Minimal structural validation.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(RelayError::Validation("title must not be empty".to_string()));
        }
        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(RelayError::Validation(format!(
                "title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(RelayError::Validation(format!(
                "description exceeds {MAX_DESCRIPTION_CHARS} characters"
            )));
        }
        if self.severity.trim().is_empty() || self.category.trim().is_empty() {
            return Err(RelayError::Validation(
                "severity and category are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Priority understood by the issue tracker and task manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest urgency.
    Low,
    /// Default urgency.
    Medium,
    /// Elevated urgency.
    High,
    /// Drop everything.
    Highest,
}

impl Priority {
    /// Maps a reporter severity onto a priority; unknown severities are `Medium`.
    #[must_use]
    pub fn from_severity(severity: &str) -> Self {
        match severity.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Highest,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Highest => write!(f, "highest"),
        }
    }
}

/// The enriched form of a submission handed to the delivery stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedPayload {
    /// Body text for the issue and task.
    pub text: String,
    /// Labels to attach.
    pub labels: Vec<String>,
    /// Delivery priority.
    pub priority: Priority,
    /// Prompt an agent can act on. Empty for local fallbacks.
    #[serde(default)]
    pub derived_prompt: String,
}

impl EnrichedPayload {
    /// Deterministic local substitute used when enrichment fails.
    ///
    /// Labels are `[category, severity]`, the text is the description
    /// verbatim (or the title when there is none), the priority follows
    /// the severity, and no prompt is derived.
    #[must_use]
    pub fn fallback(input: &SubmissionInput) -> Self {
        let text = if input.description.trim().is_empty() {
            input.title.clone()
        } else {
            input.description.clone()
        };

        Self {
            text,
            labels: vec![input.category.clone(), input.severity.clone()],
            priority: Priority::from_severity(&input.severity),
            derived_prompt: String::new(),
        }
    }

    /// Returns true if this payload carries no derived prompt.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.derived_prompt.is_empty()
    }
}

/// Reference to an object created in an external system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    /// The provider's identifier, e.g. "SEC-142".
    pub external_id: String,
    /// Browser URL of the created object.
    pub url: String,
}

impl ExternalRef {
    /// Creates a new reference.
    #[must_use]
    pub fn new(external_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            url: url.into(),
        }
    }
}
