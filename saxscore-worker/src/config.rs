//! Runtime settings for saxscore-worker
//!
//! Turns the shared [`TomlConfig`] into the worker loop, pipeline and
//! backend settings this service runs with.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use saxscore_common::config::{BackendKind, BackendSection, TomlConfig};
use tracing::{info, warn};

use crate::backend::{AnalysisBackend, ProcessBackend, StubBackend};
use crate::pipeline::PipelineConfig;

/// Default HTTP listen port
pub const DEFAULT_PORT: u16 = 5740;

/// Settings derived from the `[worker]` section
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pipeline: PipelineConfig,
    pub idle_interval: Duration,
    pub max_upload_bytes: usize,
    pub event_capacity: usize,
}

impl WorkerSettings {
    pub fn from_toml(config: &TomlConfig) -> Self {
        let worker = &config.worker;
        Self {
            pipeline: PipelineConfig {
                export_formats: worker.export_formats.clone(),
                stage_timeout: worker.stage_timeout_secs.map(Duration::from_secs),
            },
            idle_interval: Duration::from_millis(worker.idle_interval_ms),
            max_upload_bytes: worker.max_upload_bytes,
            event_capacity: worker.event_capacity,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_toml(&TomlConfig::default())
    }
}

/// Build the configured analysis backend
///
/// Process backend scratch directories go under `scratch_root` when given.
pub fn build_backend(section: &BackendSection, scratch_root: Option<&Path>) -> Arc<dyn AnalysisBackend> {
    match section.kind {
        BackendKind::Process => {
            info!(
                program = %section.program,
                args = ?section.args,
                separate = section.separate.as_str(),
                midi = section.emit_midi,
                "Using process analysis backend"
            );
            let mut backend = ProcessBackend::from_config(section);
            if let Some(root) = scratch_root {
                backend = backend.with_scratch_root(root);
            }
            Arc::new(backend)
        }
        BackendKind::Stub => {
            warn!("Using stub analysis backend; transcriptions are synthetic");
            let backend = StubBackend::new();
            Arc::new(if section.emit_midi { backend.with_midi() } else { backend })
        }
    }
}
