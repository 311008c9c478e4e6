//! Orchestrator tests against the stub backend and a real SQLite store

mod helpers;

use std::time::{Duration, Instant};

use helpers::{drain, Harness};
use saxscore_common::db::{blobs, exports, notes};
use saxscore_common::events::{JobEvent, Stage};
use saxscore_common::models::BlobKind;
use saxscore_common::{ExportFormat, Instrument, JobStatus};
use saxscore_worker::backend::{BackendError, Capability, DetectedNote, DetectionMeta, StubBackend};
use saxscore_worker::pipeline::{set_status, PipelineConfig, PipelineError, StageError};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_successful_run_commits_every_stage() {
    // Given: a claimed job and a working backend
    let harness = Harness::new(StubBackend::new()).await;
    let job = harness.claimed_job(Instrument::Alto).await;

    // When: the pipeline runs
    let outcome = harness
        .orchestrator()
        .run(&job, &CancellationToken::new())
        .await
        .unwrap();

    // Then: job is done with detection metadata
    let loaded = harness.load(job.id).await;
    assert_eq!(loaded.status, JobStatus::Done);
    assert_eq!(loaded.key_signature.as_deref(), Some("A major"));
    assert_eq!(loaded.meter.as_deref(), Some("4/4"));
    assert_eq!(loaded.tempo_bpm, Some(120.0));
    assert_eq!(loaded.notes_run_id, Some(outcome.run_id));

    // And: one isolated blob, four notes, two artifacts for this run
    let isolated = blobs::load_isolated(&harness.db, job.id, outcome.run_id).await.unwrap().unwrap();
    assert_eq!(isolated.content, b"RIFF\0\0\0\0WAVEfmt ".to_vec());
    assert_eq!(outcome.note_count, 4);
    assert_eq!(outcome.artifacts, vec!["musicxml".to_string(), "json".to_string()]);
    assert_eq!(
        exports::count_artifacts(&harness.db, job.id, Some(outcome.run_id)).await.unwrap(),
        2
    );

    let json = exports::latest_artifact(&harness.db, job.id, "json").await.unwrap().unwrap();
    let list: serde_json::Value = serde_json::from_slice(&json.content).unwrap();
    assert_eq!(list.as_array().map(|a| a.len()), Some(4));
    assert_eq!(list[0], serde_json::json!({"start": 0.0, "end": 0.5, "midi": 69}));

    let musicxml = exports::latest_artifact(&harness.db, job.id, "musicxml").await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&musicxml.content).contains("Alto Saxophone"));
}

#[tokio::test]
async fn test_stage_events_in_order() {
    let harness = Harness::new(StubBackend::new()).await;
    let job = harness.claimed_job(Instrument::Tenor).await;
    let mut rx = harness.events.subscribe();

    harness.orchestrator().run(&job, &CancellationToken::new()).await.unwrap();

    let summary: Vec<String> = drain(&mut rx)
        .into_iter()
        .map(|event| match event {
            JobEvent::StageStarted { stage, .. } => format!("start:{}", stage),
            JobEvent::StageCompleted { stage, .. } => format!("done:{}", stage),
            JobEvent::StageFailed { stage, .. } => format!("fail:{}", stage),
            JobEvent::ArtifactCreated { format, .. } => format!("artifact:{}", format),
            JobEvent::StatusChanged { new_status, .. } => format!("status:{}", new_status),
        })
        .collect();

    assert_eq!(
        summary,
        vec![
            "start:separation",
            "done:separation",
            "start:detection",
            "done:detection",
            "start:export",
            "artifact:musicxml",
            "artifact:json",
            "done:export",
            "status:done",
        ]
    );
}

#[tokio::test]
async fn test_separation_failure_stops_before_detection() {
    let harness = Harness::new(StubBackend::new().failing(Capability::Separate)).await;
    let job = harness.claimed_job(Instrument::Alto).await;

    let err = harness
        .orchestrator()
        .run(&job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Separation(StageError::Backend(BackendError::Failed { .. }))));
    assert_eq!(harness.stub.calls(Capability::Detect), 0);
    assert_eq!(blobs::count_blobs(&harness.db, job.id, BlobKind::Isolated).await.unwrap(), 0);
    assert_eq!(notes::count_notes(&harness.db, job.id, None).await.unwrap(), 0);
    assert_eq!(exports::count_artifacts(&harness.db, job.id, None).await.unwrap(), 0);
    // The caller records the failure
    assert_eq!(harness.status(job.id).await, JobStatus::Processing);
}

#[tokio::test]
async fn test_detection_failure_keeps_isolated_audio() {
    let harness = Harness::new(StubBackend::new().failing(Capability::Detect)).await;
    let job = harness.claimed_job(Instrument::Alto).await;
    let mut rx = harness.events.subscribe();

    let err = harness
        .orchestrator()
        .run(&job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Detection(_)));
    assert!(err.is_backend_failure());

    // Partial progress: the separation result stays
    assert_eq!(blobs::count_blobs(&harness.db, job.id, BlobKind::Isolated).await.unwrap(), 1);
    assert_eq!(notes::count_notes(&harness.db, job.id, None).await.unwrap(), 0);
    assert_eq!(exports::count_artifacts(&harness.db, job.id, None).await.unwrap(), 0);
    assert_eq!(harness.load(job.id).await.key_signature, None);

    let failed: Vec<Stage> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            JobEvent::StageFailed { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![Stage::Detection]);
}

#[tokio::test]
async fn test_malformed_detection_is_classified() {
    let harness = Harness::new(StubBackend::new().malformed(Capability::Detect)).await;
    let job = harness.claimed_job(Instrument::Alto).await;

    let err = harness
        .orchestrator()
        .run(&job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Detection(StageError::Backend(BackendError::MalformedResponse(_)))
    ));
}

#[tokio::test]
async fn test_stage_timeout_is_a_backend_failure() {
    let config = PipelineConfig {
        stage_timeout: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let harness = Harness::with_config(StubBackend::new().with_delay(Duration::from_secs(5)), config).await;
    let job = harness.claimed_job(Instrument::Alto).await;

    let started = Instant::now();
    let err = harness
        .orchestrator()
        .run(&job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        err,
        PipelineError::Separation(StageError::Backend(BackendError::Timeout(_)))
    ));
    assert_eq!(blobs::count_blobs(&harness.db, job.id, BlobKind::Isolated).await.unwrap(), 0);
}

#[tokio::test]
async fn test_export_failure_keeps_notes() {
    // Detection returns no notation, and the render fallback fails
    let stub = StubBackend::new().without_detection_score().failing(Capability::Render);
    let harness = Harness::new(stub).await;
    let job = harness.claimed_job(Instrument::Alto).await;

    let err = harness
        .orchestrator()
        .run(&job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Export(StageError::Backend(_))));
    assert_eq!(notes::count_notes(&harness.db, job.id, None).await.unwrap(), 4);
    assert_eq!(harness.load(job.id).await.key_signature.as_deref(), Some("A major"));
    assert_eq!(exports::count_artifacts(&harness.db, job.id, None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_musicxml_falls_back_to_render() {
    let harness = Harness::new(StubBackend::new().without_detection_score()).await;
    let job = harness.claimed_job(Instrument::Baritone).await;

    harness.orchestrator().run(&job, &CancellationToken::new()).await.unwrap();

    assert_eq!(harness.stub.calls(Capability::Render), 1);
    let musicxml = exports::latest_artifact(&harness.db, job.id, "musicxml").await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&musicxml.content).contains("Baritone Saxophone"));
}

#[tokio::test]
async fn test_midi_export_is_encoded_locally() {
    let config = PipelineConfig {
        export_formats: vec![ExportFormat::Midi],
        ..Default::default()
    };
    let harness = Harness::with_config(StubBackend::new(), config).await;
    let job = harness.claimed_job(Instrument::Alto).await;

    let outcome = harness.orchestrator().run(&job, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.artifacts, vec!["midi".to_string()]);
    let midi = exports::latest_artifact(&harness.db, job.id, "midi").await.unwrap().unwrap();
    assert_eq!(&midi.content[..4], b"MThd");
    assert_eq!(harness.stub.calls(Capability::Render), 0);
}

#[tokio::test]
async fn test_cancelled_before_first_stage() {
    let harness = Harness::new(StubBackend::new()).await;
    let job = harness.claimed_job(Instrument::Alto).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = harness.orchestrator().run(&job, &token).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled(Stage::Separation)));
    assert_eq!(harness.stub.calls(Capability::Separate), 0);
}

#[tokio::test]
async fn test_auto_hint_stores_resolved_instrument_and_measures() {
    let harness = Harness::new(StubBackend::new()).await;
    let job = harness.claimed_job(Instrument::Auto).await;

    let outcome = harness.orchestrator().run(&job, &CancellationToken::new()).await.unwrap();

    let loaded = harness.load(job.id).await;
    assert_eq!(loaded.resolved_instrument, Some(Instrument::Alto));
    assert_eq!(loaded.effective_instrument(), Instrument::Alto);

    // Half-second notes at 120 bpm in 4/4: all four land in the first measure
    let run_notes = notes::load_run_notes(&harness.db, job.id, outcome.run_id).await.unwrap();
    assert!(run_notes.iter().all(|n| n.measure == Some(0)));
    assert_eq!(run_notes.iter().map(|n| n.pitch).collect::<Vec<_>>(), vec![69, 71, 73, 74]);
}

#[tokio::test]
async fn test_missing_metadata_leaves_fields_empty() {
    let stub = StubBackend::new()
        .with_meta(DetectionMeta::default())
        .with_notes(vec![DetectedNote { start: 3.0, end: 3.5, midi: 60, velocity: None }]);
    let harness = Harness::new(stub).await;
    let job = harness.claimed_job(Instrument::Tenor).await;

    let outcome = harness.orchestrator().run(&job, &CancellationToken::new()).await.unwrap();

    let loaded = harness.load(job.id).await;
    assert_eq!(loaded.status, JobStatus::Done);
    assert_eq!(loaded.key_signature, None);
    assert_eq!(loaded.meter, None);
    assert_eq!(loaded.tempo_bpm, None);

    let run_notes = notes::load_run_notes(&harness.db, job.id, outcome.run_id).await.unwrap();
    assert_eq!(run_notes[0].measure, None);
    assert_eq!(run_notes[0].velocity, None);
}

#[tokio::test]
async fn test_job_moved_during_run_is_not_marked_done() {
    // Given: a slow run and someone else failing the job meanwhile
    let harness = Harness::new(StubBackend::new().with_delay(Duration::from_millis(200))).await;
    let job = harness.claimed_job(Instrument::Alto).await;
    let orchestrator = harness.orchestrator();
    let token = CancellationToken::new();

    let (result, moved) = tokio::join!(orchestrator.run(&job, &token), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        set_status(&harness.db, &harness.events, job.id, JobStatus::Processing, JobStatus::Error)
            .await
            .unwrap()
    });

    // Then: the run reports it instead of claiming success
    assert!(moved);
    assert!(matches!(result, Err(PipelineError::NotProcessing)));
    assert_eq!(harness.status(job.id).await, JobStatus::Error);
}
