//! Progress events shared by model downloads and index builds.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    /// Checking which artifacts are already on disk
    Resolving,
    /// Bytes received for one artifact
    Downloading,
    /// Renaming a finished temp file into place
    Finalizing,
    /// Generating skill embeddings
    Embedding,
    /// Writing embeddings to the vector store
    Storing,
    /// Loading the catalog into the keyword provider
    Indexing,
    Complete,
}

/// A single progress checkpoint.
///
/// `total` is `None` when the size is unknown (e.g. no Content-Length).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub current: u64,
    pub total: Option<u64>,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(
        phase: ProgressPhase,
        current: u64,
        total: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            current,
            total,
            message: message.into(),
        }
    }

    pub fn message(phase: ProgressPhase, message: impl Into<String>) -> Self {
        Self::new(phase, 0, None, message)
    }
}

/// Progress sink that ignores every event.
pub fn no_progress(_event: &ProgressEvent) {}

/// Renders progress events on a terminal progress bar.
///
/// Switches between a byte bar (downloads) and a counter bar (everything else)
/// as the phase changes.
pub struct ProgressBarReporter {
    bar: ProgressBar,
    phase: Mutex<Option<ProgressPhase>>,
}

impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::new(0),
            phase: Mutex::new(None),
        }
    }

    /// Reporter that never draws; useful when output is not a terminal.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            phase: Mutex::new(None),
        }
    }

    pub fn report(&self, event: &ProgressEvent) {
        if let Ok(mut phase) = self.phase.lock() {
            if *phase != Some(event.phase) {
                self.bar.set_style(Self::style_for(event.phase));
                self.bar.reset();
                *phase = Some(event.phase);
            }
        }

        if let Some(total) = event.total {
            self.bar.set_length(total);
        }
        self.bar.set_position(event.current);
        self.bar.set_message(event.message.clone());

        if event.phase == ProgressPhase::Complete {
            self.bar.finish_with_message(event.message.clone());
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    fn style_for(phase: ProgressPhase) -> ProgressStyle {
        let template = match phase {
            ProgressPhase::Downloading => {
                "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})"
            }
            _ => "{spinner} {msg} [{bar:30}] {pos}/{len}",
        };
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}
