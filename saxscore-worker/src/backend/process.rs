//! External analysis process adapter
//!
//! Spawns the analysis script once per capability call and exchanges files
//! with it inside a scratch directory:
//!
//! ```text
//! <program> [args..] --input <audio> --instrument <hint> \
//!     --output-json notes.json --output-musicxml score.musicxml \
//!     --separate <mode> [--tempo N] [--output-midi score.mid]
//!
//! <program> [args..] --input-json request.json --instrument <target> \
//!     --output-json rendered.json --output-musicxml rendered.musicxml [--output-midi rendered.mid]
//! ```
//!
//! Exit code 0 means the output files are complete. Any other exit code is a
//! failure whose stderr is reported verbatim. The scratch directory is a
//! [`tempfile::TempDir`] and is removed when the call returns, on every path.
//!
//! A running child is killed if the call's future is dropped, which is how a
//! stage timeout stops it. Cancelling the worker does not drop the future;
//! an in-flight invocation runs to completion.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use saxscore_common::config::{BackendSection, SeparationMode};
use saxscore_common::Instrument;
use tempfile::TempDir;
use tokio::process::Command;

use super::protocol::{parse_notes_document, render_request_document};
use super::{AnalysisBackend, AudioInput, BackendError, Detection, RenderRequest, RenderedScore};

/// Analysis backend that runs an external program
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: String,
    base_args: Vec<String>,
    separate: SeparationMode,
    tempo: Option<u32>,
    emit_midi: bool,
    scratch_root: Option<PathBuf>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            separate: SeparationMode::No,
            tempo: None,
            emit_midi: false,
            scratch_root: None,
        }
    }

    pub fn from_config(config: &BackendSection) -> Self {
        Self::new(config.program.clone(), config.args.clone())
            .with_separation(config.separate)
            .with_tempo(config.tempo)
            .with_midi(config.emit_midi)
    }

    pub fn with_separation(mut self, mode: SeparationMode) -> Self {
        self.separate = mode;
        self
    }

    pub fn with_tempo(mut self, tempo: Option<u32>) -> Self {
        self.tempo = tempo;
        self
    }

    pub fn with_midi(mut self, emit_midi: bool) -> Self {
        self.emit_midi = emit_midi;
        self
    }

    /// Create scratch directories under `root` instead of the system temp dir
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    fn scratch_dir(&self) -> Result<TempDir, BackendError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("saxscore-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(), BackendError> {
        let started = std::time::Instant::now();

        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::BinaryNotFound(self.program.clone()),
                _ => BackendError::Execution(e.to_string()),
            })?;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                program = %self.program,
                code = ?output.status.code(),
                elapsed_ms,
                "Analysis process failed"
            );
            return Err(BackendError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        tracing::debug!(program = %self.program, elapsed_ms, "Analysis process finished");
        Ok(())
    }
}

#[async_trait]
impl AnalysisBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    /// The analysis process isolates the instrument during detection
    /// (`--separate <mode>`), so this stage hands the upload through.
    async fn separate(&self, input: AudioInput<'_>, _hint: Instrument) -> Result<Vec<u8>, BackendError> {
        tracing::debug!(
            mode = self.separate.as_str(),
            bytes = input.bytes.len(),
            "Separation delegated to detection pass"
        );
        Ok(input.bytes.to_vec())
    }

    async fn detect(&self, input: AudioInput<'_>, hint: Instrument) -> Result<Detection, BackendError> {
        let scratch = self.scratch_dir()?;
        let audio_path = scratch.path().join(input_file_name(input.file_name));
        let notes_path = scratch.path().join("notes.json");
        let score_path = scratch.path().join("score.musicxml");
        let midi_path = scratch.path().join("score.mid");

        tokio::fs::write(&audio_path, input.bytes).await?;

        let mut args: Vec<OsString> = vec![
            "--input".into(),
            audio_path.clone().into(),
            "--instrument".into(),
            hint.as_str().into(),
            "--output-json".into(),
            notes_path.clone().into(),
            "--output-musicxml".into(),
            score_path.clone().into(),
            "--separate".into(),
            self.separate.as_str().into(),
        ];
        if let Some(tempo) = self.tempo {
            args.push("--tempo".into());
            args.push(tempo.to_string().into());
        }
        if self.emit_midi {
            args.push("--output-midi".into());
            args.push(midi_path.clone().into());
        }

        self.run(args).await?;

        let (meta, notes) = parse_notes_document(&read_output(&notes_path).await?)?;
        let musicxml = read_output(&score_path).await?;
        let midi = if self.emit_midi {
            Some(read_output(&midi_path).await?)
        } else {
            None
        };

        tracing::info!(
            notes = notes.len(),
            key = ?meta.key,
            meter = ?meta.meter,
            tempo = ?meta.tempo,
            "Detection finished"
        );

        Ok(Detection {
            meta,
            notes,
            score: RenderedScore { musicxml, midi },
        })
    }

    async fn render(&self, request: &RenderRequest) -> Result<RenderedScore, BackendError> {
        let scratch = self.scratch_dir()?;
        let request_path = scratch.path().join("request.json");
        let json_path = scratch.path().join("rendered.json");
        let score_path = scratch.path().join("rendered.musicxml");
        let midi_path = scratch.path().join("rendered.mid");

        tokio::fs::write(&request_path, render_request_document(request)?).await?;

        let mut args: Vec<OsString> = vec![
            "--input-json".into(),
            request_path.clone().into(),
            "--instrument".into(),
            request.instrument.as_str().into(),
            "--output-json".into(),
            json_path.clone().into(),
            "--output-musicxml".into(),
            score_path.clone().into(),
        ];
        if self.emit_midi {
            args.push("--output-midi".into());
            args.push(midi_path.clone().into());
        }

        self.run(args).await?;

        let musicxml = read_output(&score_path).await?;
        let midi = if self.emit_midi {
            Some(read_output(&midi_path).await?)
        } else {
            None
        };

        Ok(RenderedScore { musicxml, midi })
    }
}

/// Read an output file the process promised to write
async fn read_output(path: &Path) -> Result<Vec<u8>, BackendError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackendError::MalformedResponse(format!(
                "backend did not write {}",
                file_name
            )))
        }
        Err(e) => return Err(e.into()),
    };

    if bytes.is_empty() {
        return Err(BackendError::MalformedResponse(format!("{} is empty", file_name)));
    }
    Ok(bytes)
}

/// Scratch name for the uploaded audio, keeping a plausible extension
fn input_file_name(original: &str) -> String {
    let extension = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()));

    match extension {
        Some(ext) => format!("input.{}", ext.to_ascii_lowercase()),
        None => "input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_file_name_keeps_safe_extension() {
        assert_eq!(input_file_name("take 1.WAV"), "input.wav");
        assert_eq!(input_file_name("solo.flac"), "input.flac");
        assert_eq!(input_file_name("noext"), "input");
        assert_eq!(input_file_name("../../etc/passwd"), "input");
        assert_eq!(input_file_name("weird.m$4a"), "input");
    }

    #[test]
    fn test_from_config() {
        let section = BackendSection {
            program: "python3".to_string(),
            args: vec!["process.py".to_string()],
            separate: SeparationMode::Demucs,
            tempo: Some(90),
            emit_midi: true,
            ..Default::default()
        };

        let backend = ProcessBackend::from_config(&section);
        assert_eq!(backend.program, "python3");
        assert_eq!(backend.base_args, vec!["process.py".to_string()]);
        assert_eq!(backend.separate, SeparationMode::Demucs);
        assert_eq!(backend.tempo, Some(90));
        assert!(backend.emit_midi);
    }

    #[tokio::test]
    async fn test_missing_binary_is_classified() {
        let backend = ProcessBackend::new("saxscore-definitely-not-installed", Vec::new());
        let request = RenderRequest {
            instrument: Instrument::Alto,
            notes: Vec::new(),
            tempo: None,
            key: None,
            meter: None,
        };

        let result = backend.render(&request).await;
        assert!(matches!(result, Err(BackendError::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn test_separation_passes_audio_through() {
        let backend = ProcessBackend::new("unused", Vec::new());
        let input = AudioInput { bytes: b"mix", file_name: "a.wav" };
        assert_eq!(backend.separate(input, Instrument::Auto).await.unwrap(), b"mix".to_vec());
    }
}
