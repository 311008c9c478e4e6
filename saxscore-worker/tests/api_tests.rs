//! HTTP API tests through the full router

mod helpers;

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, Method, Request, StatusCode},
};
use helpers::Harness;
use http_body_util::BodyExt;
use saxscore_common::{Instrument, JobStatus};
use saxscore_worker::backend::StubBackend;
use saxscore_worker::build_router;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use uuid::Uuid;

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

async fn send(harness: &Harness, request: Request<Body>) -> Reply {
    let response = build_router(harness.app_state()).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Reply { status, headers, body }
}

async fn get(harness: &Harness, uri: &str) -> Reply {
    send(harness, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post(harness: &Harness, uri: &str, body: Body, content_type: Option<&str>) -> Reply {
    let mut builder = Request::builder().method(Method::POST).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    send(harness, builder.body(body).unwrap()).await
}

async fn upload(harness: &Harness, query: &str) -> Reply {
    post(
        harness,
        &format!("/transcriptions?{}", query),
        Body::from(b"RIFF\0\0\0\0WAVEfmt ".to_vec()),
        Some("application/octet-stream"),
    )
    .await
}

/// Upload and run the job through one worker tick
async fn finished_upload(harness: &Harness, instrument: &str) -> Uuid {
    let reply = upload(harness, &format!("file_name=solo.wav&instrument={}", instrument)).await;
    assert_eq!(reply.status, StatusCode::ACCEPTED);
    let id: Uuid = reply.json()["id"].as_str().unwrap().parse().unwrap();
    harness.worker().tick(&CancellationToken::new()).await;
    assert_eq!(harness.status(id).await, JobStatus::Done);
    id
}

#[tokio::test]
async fn test_upload_is_accepted_and_queued() {
    let harness = Harness::new(StubBackend::new()).await;

    let reply = upload(&harness, "file_name=take1.wav&instrument=tenor").await;

    assert_eq!(reply.status, StatusCode::ACCEPTED);
    let body = reply.json();
    assert_eq!(body["status"], "queued");
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(harness.queue.snapshot(), vec![id]);

    let job = harness.load(id).await;
    assert_eq!(job.file_name, "take1.wav");
    assert_eq!(job.instrument_hint, Instrument::Tenor);
}

#[tokio::test]
async fn test_upload_without_instrument_defaults_to_auto() {
    let harness = Harness::new(StubBackend::new()).await;

    let reply = upload(&harness, "file_name=take1.wav").await;

    assert_eq!(reply.status, StatusCode::ACCEPTED);
    let id: Uuid = reply.json()["id"].as_str().unwrap().parse().unwrap();
    assert_eq!(harness.load(id).await.instrument_hint, Instrument::Auto);
}

#[tokio::test]
async fn test_upload_rejects_bad_input() {
    let harness = Harness::new(StubBackend::new()).await;

    let empty = post(&harness, "/transcriptions?file_name=a.wav", Body::empty(), None).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
    assert_eq!(empty.json()["error"]["code"], "BAD_REQUEST");

    let unknown = upload(&harness, "file_name=a.wav&instrument=trumpet").await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

    let unnamed = upload(&harness, "file_name=%20").await;
    assert_eq!(unnamed.status, StatusCode::BAD_REQUEST);

    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn test_unknown_transcription_is_404() {
    let harness = Harness::new(StubBackend::new()).await;

    let reply = get(&harness, &format!("/transcriptions/{}", Uuid::new_v4())).await;

    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json()["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_get_transcription_after_processing() {
    let harness = Harness::new(StubBackend::new()).await;
    let id = finished_upload(&harness, "alto").await;

    let reply = get(&harness, &format!("/transcriptions/{}", id)).await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["status"], "done");
    assert_eq!(body["key_signature"], "A major");
    assert_eq!(body["meter"], "4/4");
    assert_eq!(body["note_count"], 4);
    let formats: Vec<&str> = body["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["format"].as_str().unwrap())
        .collect();
    assert_eq!(formats, vec!["musicxml", "json"]);
}

#[tokio::test]
async fn test_download_exports() {
    let harness = Harness::new(StubBackend::new()).await;
    let id = finished_upload(&harness, "alto").await;

    let musicxml = get(&harness, &format!("/transcriptions/{}/exports/musicxml", id)).await;
    assert_eq!(musicxml.status, StatusCode::OK);
    assert_eq!(
        musicxml.headers[header::CONTENT_TYPE],
        "application/vnd.recordare.musicxml+xml"
    );
    let disposition = musicxml.headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.ends_with(&format!("{}.musicxml\"", id)));
    assert!(String::from_utf8_lossy(&musicxml.body).contains("<score-partwise"));

    let notes = get(&harness, &format!("/transcriptions/{}/exports/json", id)).await;
    assert_eq!(notes.status, StatusCode::OK);
    assert_eq!(notes.headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(notes.json()[3], json!({"start": 1.5, "end": 2.0, "midi": 74}));
}

#[tokio::test]
async fn test_download_errors() {
    let harness = Harness::new(StubBackend::new()).await;
    let id = finished_upload(&harness, "alto").await;

    let unknown_tag = get(&harness, &format!("/transcriptions/{}/exports/pdf", id)).await;
    assert_eq!(unknown_tag.status, StatusCode::BAD_REQUEST);

    // Default export set has no midi
    let missing = get(&harness, &format!("/transcriptions/{}/exports/midi", id)).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let unknown_job = get(&harness, &format!("/transcriptions/{}/exports/json", Uuid::new_v4())).await;
    assert_eq!(unknown_job.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_transpose_then_download() {
    let harness = Harness::new(StubBackend::new()).await;
    let id = finished_upload(&harness, "tenor").await;

    let reply = post(
        &harness,
        &format!("/transcriptions/{}/transpose", id),
        Body::from(json!({"target": "alto"}).to_string()),
        Some("application/json"),
    )
    .await;

    assert_eq!(reply.status, StatusCode::CREATED);
    let body = reply.json();
    assert_eq!(body["format"], "musicxml-alto");
    assert_eq!(body["target"], "alto");
    assert!(body.get("midi_format").is_none());

    let download = get(&harness, &format!("/transcriptions/{}/exports/musicxml-alto", id)).await;
    assert_eq!(download.status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&download.body).contains("Alto Saxophone"));
}

#[tokio::test]
async fn test_transpose_errors() {
    let harness = Harness::new(StubBackend::new()).await;
    let id = finished_upload(&harness, "tenor").await;

    let unknown_target = post(
        &harness,
        &format!("/transcriptions/{}/transpose", id),
        Body::from(json!({"target": "kazoo"}).to_string()),
        Some("application/json"),
    )
    .await;
    assert_eq!(unknown_target.status, StatusCode::BAD_REQUEST);

    let unknown_job = post(
        &harness,
        &format!("/transcriptions/{}/transpose", Uuid::new_v4()),
        Body::from(json!({"target": "alto"}).to_string()),
        Some("application/json"),
    )
    .await;
    assert_eq!(unknown_job.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_transpose_backend_failure_is_502() {
    let harness = Harness::new(StubBackend::new().failing(saxscore_worker::backend::Capability::Render)).await;
    let id = finished_upload(&harness, "tenor").await;

    let reply = post(
        &harness,
        &format!("/transcriptions/{}/transpose", id),
        Body::from(json!({"target": "alto"}).to_string()),
        Some("application/json"),
    )
    .await;

    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.json()["error"]["code"], "BACKEND_ERROR");
}

#[tokio::test]
async fn test_retry_conflicts_until_finished() {
    let harness = Harness::new(StubBackend::new()).await;
    let reply = upload(&harness, "file_name=solo.wav").await;
    let id: Uuid = reply.json()["id"].as_str().unwrap().parse().unwrap();

    // Still queued
    let early = post(&harness, &format!("/transcriptions/{}/retry", id), Body::empty(), None).await;
    assert_eq!(early.status, StatusCode::CONFLICT);

    harness.worker().tick(&CancellationToken::new()).await;

    let retry = post(&harness, &format!("/transcriptions/{}/retry", id), Body::empty(), None).await;
    assert_eq!(retry.status, StatusCode::ACCEPTED);
    assert_eq!(retry.json()["status"], "queued");
    assert_eq!(harness.queue.snapshot(), vec![id]);
}

#[tokio::test]
async fn test_health_reports_queue_depth() {
    let harness = Harness::new(StubBackend::new()).await;
    upload(&harness, "file_name=a.wav").await;
    upload(&harness, "file_name=b.wav").await;

    let reply = get(&harness, "/health").await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "saxscore-worker");
    assert_eq!(body["queue_depth"], 2);
    assert_eq!(body["jobs"]["queued"], 2);
}
