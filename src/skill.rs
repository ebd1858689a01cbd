//! Catalog records and the embeddings derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frameworks, languages and libraries a skill targets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compatibility {
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl Compatibility {
    pub fn is_empty(&self) -> bool {
        self.frameworks.is_empty() && self.languages.is_empty() && self.libraries.is_empty()
    }

    /// All compatibility values, in framework/language/library order.
    pub fn values(&self) -> impl Iterator<Item = &String> {
        self.frameworks
            .iter()
            .chain(self.languages.iter())
            .chain(self.libraries.iter())
    }
}

/// A skill as supplied by the external catalog. Read-only to this crate.
///
/// `name` is the unique key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub compatibility: Compatibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stars: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f32>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Full SKILL document, when the catalog provides one. Long documents are
    /// embedded in overlapping chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl SkillSummary {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// One overlapping window of a skill's full document.
///
/// Line numbers are 1-based and inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub content: String,
    pub vector: Vec<f32>,
    pub start_line: usize,
    pub end_line: usize,
}

/// Embedding of a single skill, produced during an index build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillEmbedding {
    pub skill_name: String,
    pub vector: Vec<f32>,
    pub text_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Chunk>>,
    pub generated_at: DateTime<Utc>,
}

impl SkillEmbedding {
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.as_ref().map(Vec::len).unwrap_or(0)
    }
}
