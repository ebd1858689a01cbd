//! End-to-end searches through the hybrid pipeline.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use proptest::prelude::*;

use super::{hash_pipeline, skill};
use crate::config::{Config, EmbeddingConfig, LocalModelConfig, SearchConfig};
use crate::expansion::QueryExpander;
use crate::models::{ModelFile, ModelKind, ModelManager, ModelRegistry, ModelSpec};
use crate::pipeline::{HybridSearchPipeline, PipelineState, SearchFilters, SearchOptions};
use crate::progress::{no_progress, ProgressEvent, ProgressPhase};
use crate::rerank::TermOverlapReranker;
use crate::semantic::{EmbeddingBackend, EmbeddingService, FileVectorStore, LexicalKeywordIndex};
use crate::skill::SkillSummary;

fn auth_catalog() -> Vec<SkillSummary> {
    vec![
        skill("react-auth", "", &["react", "auth"]),
        skill("vue-forms", "", &["vue", "forms"]),
    ]
}

fn larger_catalog() -> Vec<SkillSummary> {
    vec![
        skill("react-auth", "Login and OAuth flows for React apps", &["react", "auth"]),
        skill("vue-forms", "Form validation for Vue", &["vue", "forms"]),
        skill("docker-deploy", "Build and ship containers", &["docker", "deployment"]),
        skill("pytest-helper", "Write Python tests with fixtures", &["python", "testing"]),
        skill("postgres-tuning", "Index and query tuning for Postgres", &["database", "sql"]),
        skill("tailwind-styling", "Utility-first CSS styling", &["css", "tailwind"]),
        skill("k8s-helm", "Helm charts for Kubernetes", &["kubernetes", "helm"]),
        skill("jwt-tokens", "Issue and verify JSON web tokens", &["auth", "jwt"]),
    ]
}

fn names(response: &crate::pipeline::HybridSearchResponse) -> Vec<&str> {
    response.results.iter().map(|r| r.skill.name.as_str()).collect()
}

#[test]
fn test_authentication_ranks_react_auth_first() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    let report = pipeline.build_index(&auth_catalog(), &no_progress).unwrap();
    assert!(!report.keyword_only);
    assert_eq!(report.embedded, 2);

    let response = pipeline
        .search(&SearchOptions::new("authentication"))
        .unwrap();
    let ranked = names(&response);
    assert_eq!(ranked[0], "react-auth");

    let top = &response.results[0];
    assert!(top.keyword_score.is_some());
    assert!(top.rrf_score.is_some());
    assert!(top.relevance <= 100);

    let expanded = response.query.expanded.as_ref().unwrap();
    assert_eq!(expanded.variations[0], "auth");
    assert_eq!(expanded.weights[0], 2.0);
    assert_eq!(top.expanded_terms.as_deref(), Some(&["auth".to_string()][..]));
}

#[test]
fn test_blank_query_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    pipeline.build_index(&auth_catalog(), &no_progress).unwrap();

    assert!(pipeline.search(&SearchOptions::new("")).unwrap().results.is_empty());
    assert!(pipeline.search(&SearchOptions::new(" \t ")).unwrap().results.is_empty());
}

#[test]
fn test_limit_one() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    pipeline.build_index(&auth_catalog(), &no_progress).unwrap();

    let response = pipeline
        .search(&SearchOptions::new("auth").with_limit(1))
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].skill.name, "react-auth");
}

#[test]
fn test_exact_name_is_top_result() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    let catalog = larger_catalog();
    pipeline.build_index(&catalog, &no_progress).unwrap();

    for skill in &catalog {
        let response = pipeline.search(&SearchOptions::new(&skill.name)).unwrap();
        assert_eq!(
            response.results.first().map(|r| r.skill.name.as_str()),
            Some(skill.name.as_str()),
            "query '{}' ranked {:?}",
            skill.name,
            names(&response)
        );
    }
}

#[test]
fn test_response_stats_and_scores() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    pipeline.build_index(&larger_catalog(), &no_progress).unwrap();

    let response = pipeline
        .search(&SearchOptions::new("react login").with_limit(3))
        .unwrap();

    assert!(response.results.len() <= 3);
    assert!(response.stats.candidates_from_keyword > 0);
    assert!(response.stats.total_merged >= response.results.len());
    assert!(!response.stats.keyword_only);
    assert!(response.timing.total >= 0.0);
    assert!(response
        .results
        .windows(2)
        .all(|w| w[0].hybrid_score >= w[1].hybrid_score));
    for result in &response.results {
        assert_eq!(result.relevance, (result.hybrid_score * 100.0).round() as u8);
    }
    assert_eq!(response.results[0].matched_terms, vec!["react", "login"]);
}

#[test]
fn test_filters_apply_after_fusion() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    pipeline.build_index(&larger_catalog(), &no_progress).unwrap();

    let filters = SearchFilters {
        tags: vec!["jwt".to_string()],
        ..Default::default()
    };
    let response = pipeline
        .search(&SearchOptions::new("auth").with_filters(filters))
        .unwrap();
    assert_eq!(names(&response), vec!["jwt-tokens"]);
}

#[test]
fn test_search_without_rerank_keeps_rrf_order() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    pipeline.build_index(&larger_catalog(), &no_progress).unwrap();

    let response = pipeline
        .search(&SearchOptions::new("auth").with_rerank(false))
        .unwrap();
    assert_eq!(response.stats.reranked, 0);
    assert!(response.results.iter().all(|r| r.reranker_score.is_none()));
    assert!(response
        .results
        .windows(2)
        .all(|w| w[0].rrf_score >= w[1].rrf_score));
    assert_eq!(response.results[0].relevance, 100);
}

#[test]
fn test_missing_model_degrades_to_keyword_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default().with_base_path(dir.path());
    config.models.model_dir = dir.path().join("models");
    config.models.auto_download = false;
    config.rerank.backend = crate::config::RerankBackendKind::TermOverlap;

    let pipeline = HybridSearchPipeline::from_config(&config);

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let report = pipeline
        .build_index(&auth_catalog(), &move |event: &ProgressEvent| {
            sink.lock().unwrap().push(event.clone());
        })
        .unwrap();
    assert!(report.keyword_only);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.phase == ProgressPhase::Embedding && e.message.contains("keyword-only")));

    let response = pipeline
        .search(&SearchOptions::new("authentication"))
        .unwrap();
    assert_eq!(names(&response), vec!["react-auth"]);
    assert!(response.results.iter().all(|r| r.vector_similarity.is_none()));
    assert!(response.stats.keyword_only);
}

#[test]
fn test_unknown_model_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default().with_base_path(dir.path());
    config.models.model_dir = dir.path().join("models");
    config.models.embed_model_id = "no-such-model".to_string();
    config.rerank.backend = crate::config::RerankBackendKind::Disabled;

    let pipeline = HybridSearchPipeline::from_config(&config);
    let err = pipeline.build_index(&auth_catalog(), &no_progress).unwrap_err();
    assert!(err.is_fatal());

    let err = pipeline
        .search(&SearchOptions::new("auth"))
        .unwrap_err();
    assert!(err.is_fatal());
}

/// Answers two requests with 404. Before answering the second one it
/// signals on the returned receiver and waits for `release`.
fn stalling_model_server(
    release: mpsc::Receiver<()>,
) -> (String, mpsc::Receiver<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (arrived_tx, arrived) = mpsc::channel();

    let handle = std::thread::spawn(move || {
        for (i, stream) in listener.incoming().take(2).enumerate() {
            let mut stream = stream.unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                    break;
                }
            }
            if i == 1 {
                arrived_tx.send(()).unwrap();
                let _ = release.recv();
            }
            let _ = stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    });

    (base, arrived, handle)
}

fn downloading_pipeline(dir: &std::path::Path, base: &str) -> HybridSearchPipeline {
    let registry = ModelRegistry::new(vec![ModelSpec {
        id: "stub-embed".to_string(),
        kind: ModelKind::Embedding,
        dimensions: Some(4),
        pooling: None,
        files: vec![ModelFile::new("model.onnx", format!("{base}/model.onnx"))],
    }]);
    let models = ModelManager::with_registry(
        LocalModelConfig {
            embed_model_id: "stub-embed".to_string(),
            model_dir: dir.join("models"),
            auto_download: true,
            download_timeout_secs: 30,
            ..LocalModelConfig::default()
        },
        registry,
    );

    let search = SearchConfig::default();
    HybridSearchPipeline::new(
        search.clone(),
        EmbeddingService::new(
            EmbeddingBackend::Local(Arc::new(models)),
            &EmbeddingConfig::default(),
        ),
        Box::new(FileVectorStore::new(
            dir.join("skill-vectors.bin"),
            search.vector_threshold,
        )),
        Arc::new(LexicalKeywordIndex::new()),
        QueryExpander::disabled(2.0),
        Box::new(TermOverlapReranker),
    )
}

#[test]
fn test_search_stays_keyword_only_while_model_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let (release_tx, release) = mpsc::channel();
    let (base, arrived, server) = stalling_model_server(release);
    let pipeline = downloading_pipeline(dir.path(), &base);

    // First download attempt fails fast; the catalog is still keyword-indexed
    let report = pipeline.build_index(&auth_catalog(), &no_progress).unwrap();
    assert!(report.keyword_only);

    // Forget the failure; the next search starts a fresh download
    pipeline.dispose();
    let response = pipeline
        .search(&SearchOptions::new("authentication"))
        .unwrap();
    assert_eq!(names(&response), vec!["react-auth"]);
    assert!(response.stats.keyword_only);

    arrived.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(pipeline.embeddings().is_loading());
    assert!(pipeline.embeddings().is_available());
    assert!(!pipeline.embeddings().is_initialized());

    std::thread::scope(|scope| {
        let searches: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| pipeline.search(&SearchOptions::new("vue forms")).unwrap()))
            .collect();
        for search in searches {
            let response = search.join().unwrap();
            assert_eq!(names(&response)[0], "vue-forms");
            assert!(response.stats.keyword_only);
            assert!(response.results.iter().all(|r| r.vector_similarity.is_none()));
        }
    });
    assert!(pipeline.embeddings().is_loading());

    release_tx.send(()).unwrap();
    let err = pipeline.embeddings().initialize().unwrap_err();
    assert!(!err.is_fatal());
    assert!(!pipeline.embeddings().is_loading());
    server.join().unwrap();
}

#[test]
fn test_vectors_persist_across_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    {
        let pipeline = hash_pipeline(dir.path());
        pipeline.build_index(&larger_catalog(), &no_progress).unwrap();
        assert_eq!(pipeline.vector_store().stats().records, 8);
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    let pipeline = hash_pipeline(dir.path());
    pipeline.initialize().unwrap();
    assert_eq!(pipeline.vector_store().stats().records, 8);
}

#[test]
fn test_rebuild_replaces_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = hash_pipeline(dir.path());
    pipeline.build_index(&larger_catalog(), &no_progress).unwrap();
    pipeline.build_index(&auth_catalog(), &no_progress).unwrap();

    assert_eq!(pipeline.vector_store().stats().records, 2);
    let response = pipeline.search(&SearchOptions::new("docker")).unwrap();
    assert!(names(&response).iter().all(|n| *n != "docker-deploy"));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn results_never_exceed_limit(
        limit in 0usize..12,
        query in prop::sample::select(
            vec!["auth", "react", "testing", "helm charts", "css", "zzz"]
        ),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = hash_pipeline(dir.path());
        pipeline.build_index(&larger_catalog(), &no_progress).unwrap();

        let response = pipeline
            .search(&SearchOptions::new(query).with_limit(limit))
            .unwrap();
        prop_assert!(response.results.len() <= limit);
    }
}
