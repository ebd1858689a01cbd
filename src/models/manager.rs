//! Model artifact manager.
//!
//! Resolves a configured model id to a directory under `model_dir`, downloading
//! missing files when `auto_download` is set. Downloads stream into a `.tmp`
//! sibling and are renamed into place only once complete, so a final path is
//! never a partial artifact and an abandoned download is safe.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::LocalModelConfig;
use crate::models::lock::ModelDirLock;
use crate::models::registry::{ModelFile, ModelKind, ModelRegistry, ModelSpec};
use crate::models::ModelError;
use crate::progress::{ProgressEvent, ProgressPhase};

/// Read size for streamed downloads (64 KiB)
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of in-flight download files
const TEMP_SUFFIX: &str = "tmp";

/// Owns the on-disk model cache.
///
/// Construct one per process and share it (`Arc<ModelManager>`) with the
/// components that need model files.
pub struct ModelManager {
    config: LocalModelConfig,
    registry: ModelRegistry,
}

impl ModelManager {
    pub fn new(config: LocalModelConfig) -> Self {
        Self::with_registry(config, ModelRegistry::builtin())
    }

    pub fn with_registry(config: LocalModelConfig, registry: ModelRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &LocalModelConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn model_dir(&self) -> &Path {
        &self.config.model_dir
    }

    /// Configured model id for `kind`.
    pub fn model_id(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Embedding => &self.config.embed_model_id,
            ModelKind::Generative => &self.config.llm_model_id,
        }
    }

    /// Registry entry of the configured model for `kind`.
    pub fn resolve(&self, kind: ModelKind) -> Result<&ModelSpec, ModelError> {
        let spec = self.registry.get(self.model_id(kind))?;
        if spec.kind != kind {
            return Err(ModelError::WrongKind {
                id: spec.id.clone(),
                expected: kind,
                actual: spec.kind,
            });
        }
        Ok(spec)
    }

    /// Directory holding the artifacts of the configured model for `kind`.
    pub fn model_path(&self, kind: ModelKind) -> Result<PathBuf, ModelError> {
        let spec = self.resolve(kind)?;
        Ok(self.config.model_dir.join(&spec.id))
    }

    /// True when every file of the configured model is on disk.
    pub fn is_present(&self, kind: ModelKind) -> Result<bool, ModelError> {
        let spec = self.resolve(kind)?;
        let dir = self.config.model_dir.join(&spec.id);
        Ok(spec.files.iter().all(|file| dir.join(&file.name).exists()))
    }

    /// Make sure the configured model for `kind` is on disk and return its directory.
    ///
    /// Existing files are never fetched again. Missing files are downloaded
    /// when `auto_download` is enabled; otherwise this fails with
    /// [`ModelError::ModelUnavailable`].
    pub fn ensure_model(
        &self,
        kind: ModelKind,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<PathBuf, ModelError> {
        let spec = self.resolve(kind)?;
        let dir = self.config.model_dir.join(&spec.id);

        progress(&ProgressEvent::message(
            ProgressPhase::Resolving,
            format!("resolving {}", spec.id),
        ));

        let missing: Vec<&ModelFile> = spec
            .files
            .iter()
            .filter(|file| !dir.join(&file.name).exists())
            .collect();

        if missing.is_empty() {
            log::debug!("model '{}' found at {}", spec.id, dir.display());
            progress(&ProgressEvent::message(
                ProgressPhase::Complete,
                format!("{} ready", spec.id),
            ));
            return Ok(dir);
        }

        if !self.config.auto_download {
            log::warn!(
                "model '{}' missing {} file(s) and auto-download is disabled",
                spec.id,
                missing.len()
            );
            return Err(ModelError::ModelUnavailable {
                id: spec.id.clone(),
                path: dir,
            });
        }

        std::fs::create_dir_all(&dir)?;
        let _lock = ModelDirLock::acquire_blocking(&self.config.model_dir)?;

        for file in missing {
            let target = dir.join(&file.name);
            // another writer may have finished it while we waited for the lock
            if target.exists() {
                continue;
            }
            log::info!("downloading {} for model '{}'", file.name, spec.id);
            self.download(file, &target, progress)?;
            log::info!("downloaded {}", target.display());
        }

        progress(&ProgressEvent::message(
            ProgressPhase::Complete,
            format!("{} ready", spec.id),
        ));

        Ok(dir)
    }

    /// Download one file into `target` via a temp file and atomic rename.
    fn download(
        &self,
        file: &ModelFile,
        target: &Path,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<(), ModelError> {
        let temp_path = temp_path_for(target);

        if let Err(e) = self.stream_to_file(file, &temp_path, progress) {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            log::warn!("download of {} failed: {}", file.url, e);
            return Err(e);
        }

        progress(&ProgressEvent::message(
            ProgressPhase::Finalizing,
            format!("finalizing {}", file.name),
        ));

        // Atomic rename
        if let Err(e) = std::fs::rename(&temp_path, target) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(download_failed(&file.url, e));
        }

        Ok(())
    }

    fn stream_to_file(
        &self,
        file: &ModelFile,
        temp_path: &Path,
        progress: &dyn Fn(&ProgressEvent),
    ) -> Result<(), ModelError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.download_timeout_secs))
            .build()
            .map_err(|e| download_failed(&file.url, e))?;

        let mut response = client
            .get(&file.url)
            .send()
            .map_err(|e| download_failed(&file.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_failed(&file.url, format!("HTTP {status}")));
        }

        let total = response.content_length();
        let out = File::create(temp_path).map_err(|e| download_failed(&file.url, e))?;
        let mut writer = BufWriter::new(out);

        let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut current: u64 = 0;

        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| download_failed(&file.url, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| download_failed(&file.url, e))?;
            current += n as u64;

            progress(&ProgressEvent::new(
                ProgressPhase::Downloading,
                current,
                total,
                file.name.clone(),
            ));
        }

        if let Some(total) = total {
            if current != total {
                return Err(download_failed(
                    &file.url,
                    format!("received {current} of {total} bytes"),
                ));
            }
        }

        // Flush and sync
        writer.flush().map_err(|e| download_failed(&file.url, e))?;
        let out = writer
            .into_inner()
            .map_err(|e| download_failed(&file.url, e.into_error()))?;
        out.sync_all().map_err(|e| download_failed(&file.url, e))?;

        Ok(())
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_SUFFIX);
    target.with_file_name(name)
}

fn download_failed(url: &str, reason: impl std::fmt::Display) -> ModelError {
    ModelError::DownloadFailed {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::no_progress;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::Mutex;

    /// Serve `requests` HTTP responses with the given status line and body.
    /// `declared_len` lets a test lie about Content-Length to simulate truncation.
    fn serve(
        status: &'static str,
        body: Vec<u8>,
        declared_len: Option<usize>,
        requests: usize,
    ) -> (String, std::thread::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = std::thread::spawn(move || {
            let mut served = 0;
            for stream in listener.incoming().take(requests) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                        break;
                    }
                }
                let len = declared_len.unwrap_or(body.len());
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
                served += 1;
            }
            served
        });

        (base, handle)
    }

    fn test_registry(base: &str) -> ModelRegistry {
        ModelRegistry::new(vec![
            ModelSpec {
                id: "tiny-embed".to_string(),
                kind: ModelKind::Embedding,
                dimensions: Some(4),
                pooling: None,
                files: vec![
                    ModelFile::new("weights.bin", format!("{base}/weights.bin")),
                    ModelFile::new("vocab.txt", format!("{base}/vocab.txt")),
                ],
            },
            ModelSpec {
                id: "tiny-llm".to_string(),
                kind: ModelKind::Generative,
                dimensions: None,
                pooling: None,
                files: vec![ModelFile::new("tiny.gguf", format!("{base}/tiny.gguf"))],
            },
        ])
    }

    fn test_config(model_dir: &Path, auto_download: bool) -> LocalModelConfig {
        LocalModelConfig {
            embed_model_id: "tiny-embed".to_string(),
            llm_model_id: "tiny-llm".to_string(),
            model_dir: model_dir.to_path_buf(),
            auto_download,
            gpu_layers: 0,
            download_timeout_secs: 10,
        }
    }

    #[test]
    fn test_existing_files_are_returned_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("tiny-embed");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("weights.bin"), b"w").unwrap();
        std::fs::write(model_dir.join("vocab.txt"), b"v").unwrap();

        // unroutable base: any network access would fail
        let manager = ModelManager::with_registry(
            test_config(dir.path(), false),
            test_registry("http://127.0.0.1:9"),
        );

        let path = manager.ensure_model(ModelKind::Embedding, &no_progress).unwrap();
        assert_eq!(path, model_dir);
        assert!(manager.is_present(ModelKind::Embedding).unwrap());
    }

    #[test]
    fn test_missing_model_without_auto_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_registry(
            test_config(dir.path(), false),
            test_registry("http://127.0.0.1:9"),
        );

        let result = manager.ensure_model(ModelKind::Embedding, &no_progress);
        assert!(matches!(result, Err(ModelError::ModelUnavailable { .. })));
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), true);
        config.embed_model_id = "does-not-exist".to_string();
        let manager = ModelManager::with_registry(config, test_registry("http://127.0.0.1:9"));

        let err = manager.ensure_model(ModelKind::Embedding, &no_progress).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("tiny-embed"));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), true);
        config.embed_model_id = "tiny-llm".to_string();
        let manager = ModelManager::with_registry(config, test_registry("http://127.0.0.1:9"));

        let err = manager.resolve(ModelKind::Embedding).unwrap_err();
        assert!(matches!(err, ModelError::WrongKind { .. }));
    }

    #[test]
    fn test_download_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![7u8; 200_000];
        let (base, server) = serve("200 OK", body.clone(), None, 2);

        let manager =
            ModelManager::with_registry(test_config(dir.path(), true), test_registry(&base));

        let events = Mutex::new(Vec::new());
        let path = manager
            .ensure_model(ModelKind::Embedding, &|e| events.lock().unwrap().push(e.clone()))
            .unwrap();

        assert_eq!(server.join().unwrap(), 2);
        assert_eq!(std::fs::read(path.join("weights.bin")).unwrap(), body);
        assert!(path.join("vocab.txt").exists());
        assert!(!path.join("weights.bin.tmp").exists());

        let events = events.into_inner().unwrap();
        let downloads: Vec<&ProgressEvent> = events
            .iter()
            .filter(|e| e.phase == ProgressPhase::Downloading)
            .collect();
        assert!(downloads.len() >= 2);
        assert!(downloads
            .windows(2)
            .all(|w| w[0].message != w[1].message || w[0].current <= w[1].current));
        assert_eq!(downloads.last().unwrap().total, Some(body.len() as u64));
        assert_eq!(events.last().unwrap().phase, ProgressPhase::Complete);

        // server is gone; a second ensure must not touch the network
        let again = manager.ensure_model(ModelKind::Embedding, &no_progress).unwrap();
        assert_eq!(again, path);
    }

    #[test]
    fn test_http_error_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _server) = serve("404 Not Found", b"missing".to_vec(), None, 1);

        let manager =
            ModelManager::with_registry(test_config(dir.path(), true), test_registry(&base));

        let err = manager.ensure_model(ModelKind::Generative, &no_progress).unwrap_err();
        assert!(matches!(err, ModelError::DownloadFailed { .. }));

        let model_dir = dir.path().join("tiny-llm");
        assert!(!model_dir.join("tiny.gguf").exists());
        assert!(!model_dir.join("tiny.gguf.tmp").exists());
    }

    #[test]
    fn test_truncated_download_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _server) = serve("200 OK", vec![1u8; 1000], Some(5000), 1);

        let manager =
            ModelManager::with_registry(test_config(dir.path(), true), test_registry(&base));

        let err = manager.ensure_model(ModelKind::Generative, &no_progress).unwrap_err();
        assert!(matches!(err, ModelError::DownloadFailed { .. }));

        let model_dir = dir.path().join("tiny-llm");
        assert!(!model_dir.join("tiny.gguf").exists());
        assert!(!model_dir.join("tiny.gguf.tmp").exists());
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let target = Path::new("/models/x/model.onnx");
        assert_eq!(temp_path_for(target), PathBuf::from("/models/x/model.onnx.tmp"));
    }
}
