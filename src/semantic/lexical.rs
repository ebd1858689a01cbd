//! Keyword provider contract and the built-in lexical implementation.
//!
//! The hybrid pipeline only talks to [`KeywordProvider`]; any external
//! keyword engine can stand in for [`LexicalKeywordIndex`].
//!
//! Length normalization: description matches are weighted inversely to description
//! length to prevent long descriptions from having unfair advantage due to more
//! surface area for substring matches.

use std::sync::RwLock;

use crate::skill::SkillSummary;

#[derive(Debug, thiserror::Error)]
pub enum KeywordError {
    #[error("Keyword search failed: {0}")]
    Failed(String),
}

/// One keyword search request.
#[derive(Clone, Debug, PartialEq)]
pub struct KeywordQuery {
    pub query: String,
    pub limit: usize,
    /// Allow the provider to broaden matching beyond literal terms
    pub semantic: bool,
}

/// A keyword match with relevance in `0..=100`.
#[derive(Clone, Debug, PartialEq)]
pub struct KeywordHit {
    pub skill_name: String,
    pub relevance: f32,
}

pub trait KeywordProvider: Send + Sync {
    /// Replace the searchable catalog.
    fn index(&self, skills: &[SkillSummary]) -> Result<(), KeywordError>;

    /// Hits sorted by relevance, best first, at most `query.limit`.
    fn search(&self, query: &KeywordQuery) -> Result<Vec<KeywordHit>, KeywordError>;
}

/// Tokenize query into lowercase terms.
/// Filters out very short terms (1 char) and common stop words.
pub fn tokenize(query: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
        "in", "on", "at", "to", "for", "of", "with", "by", "from", "as",
        "and", "or", "but", "not", "no", "so", "if", "then",
    ];

    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.len() > 1 && !STOP_WORDS.contains(&s.as_str()))
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Query terms that literally occur in a skill's name, description, tags
/// or compatibility values.
pub fn matched_terms(query: &str, skill: &SkillSummary) -> Vec<String> {
    let entry = IndexedSkill::new(skill);
    tokenize(query)
        .into_iter()
        .filter(|term| entry.term_hits(term, false) > 0.0)
        .collect()
}

/// Baseline description length for normalization (characters).
/// Descriptions at or below this length get full weight.
const DESC_LENGTH_BASELINE: f32 = 100.0;

const NAME_WEIGHT: f32 = 2.0;
const TAG_WEIGHT: f32 = 3.0;
const RELATED_TAG_WEIGHT: f32 = 1.5;
const COMPATIBILITY_WEIGHT: f32 = 1.0;

/// Each matched term outranks any amount of extra hits on fewer terms
/// (up to this many hits per term).
const MATCHED_TERM_BONUS: f32 = 10.0;

/// Minimum length for prefix matching between terms and tags.
const MIN_PREFIX_LEN: usize = 3;

/// Compute description match weight based on length.
///
/// - 100 chars or less: 1.0 (full weight)
/// - 270 chars: ~0.5
/// - 730 chars: ~0.33
fn description_length_weight(len: usize) -> f32 {
    if len <= DESC_LENGTH_BASELINE as usize {
        return 1.0;
    }
    // Logarithmic decay: 1 / (1 + ln(len / baseline))
    1.0 / (1.0 + (len as f32 / DESC_LENGTH_BASELINE).ln())
}

struct IndexedSkill {
    name: String,
    name_lower: String,
    description_lower: String,
    description_weight: f32,
    tags_lower: Vec<String>,
    compatibility_lower: Vec<String>,
}

impl IndexedSkill {
    fn new(skill: &SkillSummary) -> Self {
        Self {
            name: skill.name.clone(),
            name_lower: skill.name.to_lowercase(),
            description_lower: skill.description.to_lowercase(),
            description_weight: description_length_weight(skill.description.len()),
            tags_lower: skill.tags.iter().map(|t| t.to_lowercase()).collect(),
            compatibility_lower: skill
                .compatibility
                .values()
                .map(|v| v.to_lowercase())
                .collect(),
        }
    }

    /// Weighted hits of a single term across all fields.
    fn term_hits(&self, term: &str, semantic: bool) -> f32 {
        let mut hits = 0.0;

        if self.name_lower.contains(term) {
            hits += NAME_WEIGHT;
        }

        if self.description_lower.contains(term) {
            hits += self.description_weight;
        }

        // Tag match (exact or hierarchy prefix), optionally stem-like prefixes
        for tag in &self.tags_lower {
            if tag == term || tag.starts_with(&format!("{}/", term)) {
                hits += TAG_WEIGHT;
            } else if semantic && prefix_related(tag, term) {
                hits += RELATED_TAG_WEIGHT;
            }
        }

        if self.compatibility_lower.iter().any(|value| value == term) {
            hits += COMPATIBILITY_WEIGHT;
        }

        hits
    }

    /// Returns (unique_terms_matched, total weighted hits).
    fn count_matches(&self, terms: &[String], semantic: bool) -> (usize, f32) {
        terms
            .iter()
            .map(|term| self.term_hits(term, semantic))
            .filter(|hits| *hits > 0.0)
            .fold((0, 0.0), |(matched, total), hits| (matched + 1, total + hits))
    }
}

/// One of `a`, `b` is a prefix of the other, and the shorter is long enough.
fn prefix_related(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= MIN_PREFIX_LEN && long.starts_with(short)
}

/// In-memory keyword index over skill names, descriptions, tags and
/// compatibility values.
#[derive(Default)]
pub struct LexicalKeywordIndex {
    skills: RwLock<Vec<IndexedSkill>>,
}

impl LexicalKeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.skills.read().map(|skills| skills.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeywordProvider for LexicalKeywordIndex {
    fn index(&self, skills: &[SkillSummary]) -> Result<(), KeywordError> {
        let entries = skills.iter().map(IndexedSkill::new).collect();
        let mut guard = self
            .skills
            .write()
            .map_err(|e| KeywordError::Failed(format!("Lock poisoned: {}", e)))?;
        *guard = entries;
        Ok(())
    }

    fn search(&self, query: &KeywordQuery) -> Result<Vec<KeywordHit>, KeywordError> {
        let terms = tokenize(&query.query);
        if terms.is_empty() || query.limit == 0 {
            return Ok(vec![]);
        }

        let skills = self
            .skills
            .read()
            .map_err(|e| KeywordError::Failed(format!("Lock poisoned: {}", e)))?;

        let mut scored: Vec<(&str, f32)> = skills
            .iter()
            .filter_map(|skill| {
                let (matched, hits) = skill.count_matches(&terms, query.semantic);
                (matched > 0).then(|| {
                    (
                        skill.name.as_str(),
                        matched as f32 * MATCHED_TERM_BONUS + hits,
                    )
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(query.limit);

        let best = scored.first().map(|(_, score)| *score).unwrap_or(1.0);
        Ok(scored
            .into_iter()
            .map(|(name, score)| KeywordHit {
                skill_name: name.to_string(),
                relevance: score / best * 100.0,
            })
            .collect())
    }
}
