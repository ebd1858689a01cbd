//! Query expansion.
//!
//! Broadens one query into weighted variants to improve keyword recall.
//! The literal query keeps a high weight (`weights[0]`, default 2.0) so
//! variants supplement it rather than dominate it. Expansion never fails
//! from the caller's point of view: any backend problem yields a degenerate
//! expansion with no variations.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::{ExpansionBackendKind, ExpansionConfig, LocalModelConfig};
use crate::semantic::lexical::tokenize;

#[derive(Debug, thiserror::Error)]
pub enum ExpansionError {
    #[error("Expansion backend unavailable: {0}")]
    Unavailable(String),

    #[error("Expansion request failed: {0}")]
    Request(String),

    #[error("Invalid expansion response: {0}")]
    InvalidResponse(String),

    #[error("Failed to read related terms from {path}: {reason}")]
    RelatedTerms { path: String, reason: String },
}

/// A query plus its weighted variants.
///
/// `weights[0]` belongs to `original`; `weights[i + 1]` to `variations[i]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExpandedQuery {
    pub original: String,
    pub variations: Vec<String>,
    pub weights: Vec<f32>,
}

impl ExpandedQuery {
    /// Expansion with no variations; what disabled or failed expansion yields.
    pub fn degenerate(original: impl Into<String>, original_weight: f32) -> Self {
        Self {
            original: original.into(),
            variations: Vec::new(),
            weights: vec![original_weight],
        }
    }

    pub fn is_expanded(&self) -> bool {
        !self.variations.is_empty()
    }

    /// Every query string with its weight, original first.
    pub fn queries(&self) -> impl Iterator<Item = (&str, f32)> {
        std::iter::once(self.original.as_str())
            .chain(self.variations.iter().map(String::as_str))
            .enumerate()
            .map(|(i, query)| (query, self.weights.get(i).copied().unwrap_or(1.0)))
    }
}

/// Produces candidate rewrites of a query.
pub trait ExpansionModel: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    /// Up to `max` rewrites; the caller deduplicates.
    fn variations(&self, query: &str, max: usize) -> Result<Vec<String>, ExpansionError>;
}

static BUILTIN_RELATED_TERMS: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    let table: &[(&str, &[&str])] = &[
        ("authentication", &["auth", "login", "oauth", "jwt"]),
        ("auth", &["authentication", "login", "oauth"]),
        ("login", &["auth", "authentication", "signin"]),
        ("authorization", &["auth", "permissions", "rbac"]),
        ("testing", &["test", "jest", "vitest", "pytest"]),
        ("test", &["testing", "unit", "e2e"]),
        ("database", &["db", "sql", "postgres"]),
        ("db", &["database", "sql"]),
        ("frontend", &["ui", "react", "vue"]),
        ("backend", &["api", "server"]),
        ("api", &["rest", "graphql", "http"]),
        ("deployment", &["deploy", "ci", "docker"]),
        ("deploy", &["deployment", "ci", "docker"]),
        ("kubernetes", &["k8s", "helm"]),
        ("k8s", &["kubernetes", "helm"]),
        ("javascript", &["js", "typescript", "node"]),
        ("js", &["javascript"]),
        ("typescript", &["ts", "javascript"]),
        ("ts", &["typescript"]),
        ("python", &["py"]),
        ("py", &["python"]),
        ("documentation", &["docs", "readme"]),
        ("docs", &["documentation", "readme"]),
        ("forms", &["form", "validation"]),
        ("styling", &["css", "tailwind"]),
        ("css", &["styling", "tailwind"]),
        ("security", &["auth", "vulnerability", "audit"]),
        ("performance", &["optimization", "profiling"]),
        ("ml", &["machine-learning", "model"]),
        ("llm", &["ai", "prompt"]),
    ];

    table
        .iter()
        .map(|(term, related)| {
            (
                term.to_string(),
                related.iter().map(|r| r.to_string()).collect(),
            )
        })
        .collect()
});

/// Expansion from a term → related terms table.
///
/// Each variant replaces one query term with one related term. The table is
/// data, not code: swap it with [`RelatedTermsExpansion::from_yaml_file`].
pub struct RelatedTermsExpansion {
    table: HashMap<String, Vec<String>>,
}

impl Default for RelatedTermsExpansion {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RelatedTermsExpansion {
    pub fn builtin() -> Self {
        Self::new(BUILTIN_RELATED_TERMS.clone())
    }

    pub fn new(table: HashMap<String, Vec<String>>) -> Self {
        let table = table
            .into_iter()
            .map(|(term, related)| {
                (
                    term.to_lowercase(),
                    related.into_iter().map(|r| r.to_lowercase()).collect(),
                )
            })
            .collect();
        Self { table }
    }

    /// Load a YAML mapping of `term: [related, ...]`.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ExpansionError> {
        let failed = |reason: String| ExpansionError::RelatedTerms {
            path: path.display().to_string(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| failed(e.to_string()))?;
        let table: HashMap<String, Vec<String>> =
            serde_yml::from_str(&content).map_err(|e| failed(e.to_string()))?;
        Ok(Self::new(table))
    }
}

impl ExpansionModel for RelatedTermsExpansion {
    fn name(&self) -> &str {
        "related-terms"
    }

    fn variations(&self, query: &str, max: usize) -> Result<Vec<String>, ExpansionError> {
        let terms = tokenize(query);
        let mut variations = Vec::new();

        for (i, term) in terms.iter().enumerate() {
            let Some(related) = self.table.get(term) else {
                continue;
            };

            for replacement in related {
                if variations.len() >= max {
                    return Ok(variations);
                }
                let mut rewritten = terms.clone();
                rewritten[i] = replacement.clone();
                variations.push(rewritten.join(" "));
            }
        }

        Ok(variations)
    }
}

const LLM_SYSTEM_PROMPT: &str = "You rewrite search queries for a catalog of developer \
skills. Reply with alternative queries only, one per line, no numbering, no commentary.";

static LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:[-*•]|\d+[.)])?\s*["'`]?(.*?)["'`]?\s*$"#)
        .expect("list marker regex is valid")
});

/// Expansion through an OpenAI-compatible `/v1/chat/completions` endpoint,
/// e.g. a local llama.cpp server hosting the generative model.
pub struct LlmExpansion {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl LlmExpansion {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExpansionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ExpansionError::Unavailable(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    fn chat(&self, prompt: &str) -> Result<String, ExpansionError> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": LLM_SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.2,
            "max_tokens": 128,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| ExpansionError::Request(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().unwrap_or_default();
            return Err(ExpansionError::Request(format!(
                "LLM API error {status}: {body_text}"
            )));
        }

        let response_body: serde_json::Value = response
            .json()
            .map_err(|e| {
                ExpansionError::InvalidResponse(format!("failed to parse response: {e}"))
            })?;

        response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ExpansionError::InvalidResponse(format!(
                    "unexpected response structure: {response_body}"
                ))
            })
    }
}

/// One cleaned variant per non-empty line.
fn parse_variations(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let cleaned = LIST_MARKER
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim())
                .unwrap_or_else(|| line.trim());
            (!cleaned.is_empty()).then(|| cleaned.to_string())
        })
        .collect()
}

impl ExpansionModel for LlmExpansion {
    fn name(&self) -> &str {
        &self.model
    }

    fn variations(&self, query: &str, max: usize) -> Result<Vec<String>, ExpansionError> {
        if max == 0 {
            return Ok(vec![]);
        }

        let prompt = format!("Give {max} alternative search queries for: {query}");
        let mut variations = parse_variations(&self.chat(&prompt)?);
        variations.truncate(max);
        Ok(variations)
    }
}

/// Wraps an optional [`ExpansionModel`] with weighting, deduplication and
/// degradation.
pub struct QueryExpander {
    model: Option<Box<dyn ExpansionModel>>,
    original_weight: f32,
    max_variations: usize,
}

impl QueryExpander {
    pub fn new(
        model: Option<Box<dyn ExpansionModel>>,
        original_weight: f32,
        max_variations: usize,
    ) -> Self {
        Self {
            model,
            original_weight,
            max_variations,
        }
    }

    pub fn disabled(original_weight: f32) -> Self {
        Self::new(None, original_weight, 0)
    }

    pub fn from_config(config: &ExpansionConfig, models: &LocalModelConfig) -> Self {
        let model: Option<Box<dyn ExpansionModel>> = match config.backend {
            ExpansionBackendKind::RelatedTerms => Some(Box::new(match &config.related_terms_path {
                Some(path) => RelatedTermsExpansion::from_yaml_file(path).unwrap_or_else(|e| {
                    log::warn!("{}; using built-in related terms", e);
                    RelatedTermsExpansion::builtin()
                }),
                None => RelatedTermsExpansion::builtin(),
            })),
            ExpansionBackendKind::Llm => match LlmExpansion::new(
                config.endpoint.clone(),
                models.llm_model_id.clone(),
                Duration::from_secs(config.timeout_secs),
            ) {
                Ok(llm) => Some(Box::new(llm)),
                Err(e) => {
                    log::warn!("Query expansion disabled: {}", e);
                    None
                }
            },
            ExpansionBackendKind::Disabled => None,
        };

        Self::new(model, config.original_weight, config.max_variations)
    }

    pub fn is_available(&self) -> bool {
        self.model.as_ref().is_some_and(|m| m.is_available())
    }

    pub fn original_weight(&self) -> f32 {
        self.original_weight
    }

    /// Expand `query`. Never fails; backend errors yield a degenerate expansion.
    pub fn expand(&self, query: &str) -> ExpandedQuery {
        let query = query.trim();
        let mut expanded = ExpandedQuery::degenerate(query, self.original_weight);

        let Some(model) = self.model.as_ref().filter(|m| m.is_available()) else {
            return expanded;
        };
        if query.is_empty() || self.max_variations == 0 {
            return expanded;
        }

        let candidates = match model.variations(query, self.max_variations) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("Query expansion via '{}' failed: {}", model.name(), e);
                return expanded;
            }
        };

        let original_key = query.to_lowercase();
        for candidate in candidates {
            let candidate = candidate.trim().to_string();
            let key = candidate.to_lowercase();
            if candidate.is_empty()
                || key == original_key
                || expanded.variations.iter().any(|v| v.to_lowercase() == key)
            {
                continue;
            }
            expanded.variations.push(candidate);
            expanded.weights.push(1.0);
            if expanded.variations.len() >= self.max_variations {
                break;
            }
        }

        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    struct FailingModel;

    impl ExpansionModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }

        fn variations(&self, _query: &str, _max: usize) -> Result<Vec<String>, ExpansionError> {
            Err(ExpansionError::Unavailable("model not loaded".to_string()))
        }
    }

    struct FixedModel(Vec<&'static str>);

    impl ExpansionModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn variations(&self, _query: &str, _max: usize) -> Result<Vec<String>, ExpansionError> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    /// Serves one HTTP response and returns the raw request.
    fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            l.to_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (endpoint, handle)
    }

    #[test]
    fn test_degenerate_expansion() {
        let expanded = ExpandedQuery::degenerate("auth", 2.0);
        assert!(!expanded.is_expanded());
        assert_eq!(expanded.weights, vec![2.0]);
        assert_eq!(expanded.queries().collect::<Vec<_>>(), vec![("auth", 2.0)]);
    }

    #[test]
    fn test_related_terms_replace_one_term() {
        let model = RelatedTermsExpansion::builtin();
        let variations = model.variations("authentication flow", 3).unwrap();
        assert_eq!(variations, vec!["auth flow", "login flow", "oauth flow"]);
    }

    #[test]
    fn test_related_terms_unknown_query() {
        let model = RelatedTermsExpansion::builtin();
        assert!(model.variations("zzz qqq", 3).unwrap().is_empty());
    }

    #[test]
    fn test_related_terms_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("related.yaml");
        std::fs::write(&path, "Widgets:\n  - Gadgets\n  - gizmos\n").unwrap();

        let model = RelatedTermsExpansion::from_yaml_file(&path).unwrap();
        assert_eq!(model.variations("widgets", 5).unwrap(), vec!["gadgets", "gizmos"]);

        let missing = RelatedTermsExpansion::from_yaml_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ExpansionError::RelatedTerms { .. })));
    }

    #[test]
    fn test_expander_weights_and_cap() {
        let expander = QueryExpander::new(Some(Box::new(RelatedTermsExpansion::builtin())), 2.0, 2);
        let expanded = expander.expand("  authentication ");

        assert_eq!(expanded.original, "authentication");
        assert_eq!(expanded.variations, vec!["auth", "login"]);
        assert_eq!(expanded.weights, vec![2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_expander_dedupes_and_drops_original() {
        let model = FixedModel(vec!["React Auth", "react auth", "", "login", "LOGIN"]);
        let expander = QueryExpander::new(Some(Box::new(model)), 2.0, 5);

        let expanded = expander.expand("react auth");
        assert_eq!(expanded.variations, vec!["login"]);
        assert_eq!(expanded.weights.len(), expanded.variations.len() + 1);
    }

    #[test]
    fn test_expander_failure_is_degenerate() {
        let expander = QueryExpander::new(Some(Box::new(FailingModel)), 2.0, 3);
        let expanded = expander.expand("auth");
        assert_eq!(expanded, ExpandedQuery::degenerate("auth", 2.0));
    }

    #[test]
    fn test_disabled_expander() {
        let expander = QueryExpander::disabled(2.0);
        assert!(!expander.is_available());
        assert!(!expander.expand("authentication").is_expanded());
    }

    #[test]
    fn test_parse_variations_strips_markers() {
        let parsed = parse_variations("1. react login\n- \"oauth react\"\n\n* jwt auth\n2) sso");
        assert_eq!(parsed, vec!["react login", "oauth react", "jwt auth", "sso"]);
    }

    #[test]
    fn test_llm_expansion_round_trip() {
        let body = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "react login\nreact oauth\nreact jwt\nextra" } }]
        })
        .to_string();
        let (endpoint, server) = serve_once("200 OK", body);

        let llm =
            LlmExpansion::new(endpoint, "qwen2.5-0.5b-instruct", Duration::from_secs(5)).unwrap();
        let variations = llm.variations("react auth", 3).unwrap();
        assert_eq!(variations, vec!["react login", "react oauth", "react jwt"]);

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.contains("qwen2.5-0.5b-instruct"));
    }

    #[test]
    fn test_llm_http_error_degrades() {
        let (endpoint, server) = serve_once("500 Internal Server Error", "{}".to_string());
        let llm = LlmExpansion::new(endpoint, "m", Duration::from_secs(5)).unwrap();

        assert!(matches!(
            llm.variations("auth", 3),
            Err(ExpansionError::Request(_))
        ));
        server.join().unwrap();

        let (endpoint, server) = serve_once("500 Internal Server Error", "{}".to_string());
        let expander = QueryExpander::new(
            Some(Box::new(LlmExpansion::new(endpoint, "m", Duration::from_secs(5)).unwrap())),
            2.0,
            3,
        );
        assert!(!expander.expand("auth").is_expanded());
        server.join().unwrap();
    }
}
