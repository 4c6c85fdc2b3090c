//! End-to-end orchestrator tests: upload through the HTTP surface, then
//! observe status events and the persisted record.

mod common;

use tokio::sync::mpsc;

use common::{accepted_id, upload, upload_form, FakeProber, TestHarness};
use vg_core::events::StatusEvent;
use vg_core::{ProcessingState, Role, SensitivityVerdict};

fn drain(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn demo_upload_completes_with_metadata() {
    let (h, addr) = TestHarness::with_server().await;
    let (owner, token) = h.session(Role::Editor, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = h.ctx.status.subscribe(owner, tx);

    let id = accepted_id(upload(addr, &token, upload_form("demo", "video/mp4", vec![9u8; 2048])).await).await;
    let record = h.wait_terminal(id).await;

    assert_eq!(record.state, ProcessingState::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.verdict, SensitivityVerdict::Safe);
    assert!((record.duration_secs.unwrap() - 10.0).abs() < 0.5);
    assert_eq!(record.width, Some(1280));
    assert_eq!(record.height, Some(720));
    assert!(record.thumbnail_handle.is_some());

    let events = drain(&mut rx);
    let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
    assert_eq!(progress, vec![10, 30, 80, 100]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    let last = events.last().unwrap();
    assert_eq!(last.thumbnail_handle, record.thumbnail_handle);

    // the thumbnail is served to the owner
    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/api/videos/{id}/thumbnail"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    assert!(resp.bytes().await.unwrap().starts_with(b"\xff\xd8"));
}

#[tokio::test]
async fn sensitive_title_is_flagged_and_gated() {
    let (h, addr) = TestHarness::with_server().await;
    let (_, token) = h.session(Role::Editor, None);
    let (_, moderator) = h.session(Role::Moderator, None);

    let id = accepted_id(
        upload(addr, &token, upload_form("explicit content test", "video/mp4", vec![1u8; 1000])).await,
    )
    .await;
    let record = h.wait_terminal(id).await;
    assert_eq!(record.state, ProcessingState::Completed);
    assert_eq!(record.verdict, SensitivityVerdict::Flagged);

    let stream = |t: &str| format!("http://{addr}/api/videos/stream/{id}?token={t}");
    assert_eq!(reqwest::get(stream(&token)).await.unwrap().status(), 403);
    assert_eq!(reqwest::get(stream(&moderator)).await.unwrap().status(), 200);

    // a moderator clears the verdict; the owner can now watch
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/videos/{id}/moderation"))
        .bearer_auth(&moderator)
        .json(&serde_json::json!({ "verdict": "safe" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["verdict"], "safe");
    assert_eq!(body["verdictOverridden"], true);
    assert_eq!(reqwest::get(stream(&token)).await.unwrap().status(), 200);
}

#[tokio::test]
async fn moderation_requires_elevated_role() {
    let (h, addr) = TestHarness::with_server().await;
    let (owner, token) = h.session(Role::Editor, None);
    let id = h
        .completed_video(owner, None, &[0u8; 10], SensitivityVerdict::Flagged)
        .await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/videos/{id}/moderation"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "verdict": "safe" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(h.video(id).verdict, SensitivityVerdict::Flagged);
}

#[tokio::test]
async fn missing_prober_degrades_to_completed() {
    let (h, addr) = TestHarness::with_server_prober(FakeProber::unavailable()).await;
    let (owner, token) = h.session(Role::Editor, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = h.ctx.status.subscribe(owner, tx);

    let id = accepted_id(upload(addr, &token, upload_form("demo", "video/mp4", vec![2u8; 100])).await).await;
    let record = h.wait_terminal(id).await;

    assert_eq!(record.state, ProcessingState::Completed);
    assert!(record.duration_secs.is_none());
    assert!(record.width.is_none());
    assert!(record.height.is_none());
    assert!(record.thumbnail_handle.is_none());
    assert_eq!(record.verdict, SensitivityVerdict::Safe);
    assert_eq!(h.prober.probe_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let progress: Vec<u8> = drain(&mut rx).iter().map(|e| e.progress).collect();
    assert_eq!(progress, vec![10, 100]);

    // degraded videos remain streamable
    let resp = reqwest::get(format!("http://{addr}/api/videos/stream/{id}?token={token}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().len(), 100);
}

#[tokio::test]
async fn unprobeable_upload_fails_terminally() {
    let (h, addr) = TestHarness::with_server_prober(FakeProber::failing("moov atom not found")).await;
    let (owner, token) = h.session(Role::Editor, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = h.ctx.status.subscribe(owner, tx);

    let id = accepted_id(upload(addr, &token, upload_form("demo", "video/mp4", vec![0u8; 64])).await).await;
    let record = h.wait_terminal(id).await;

    assert_eq!(record.state, ProcessingState::Failed);
    assert_eq!(record.progress, 0);
    assert!(record.error_message.as_deref().unwrap().contains("moov atom"));
    // classification ran before the probe
    assert_eq!(record.verdict, SensitivityVerdict::Safe);

    let events = drain(&mut rx);
    let last = events.last().unwrap();
    assert_eq!(last.state, ProcessingState::Failed);
    assert!(events
        .iter()
        .all(|e| e.state != ProcessingState::Completed));

    let resp = reqwest::get(format!("http://{addr}/api/videos/stream/{id}?token={token}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // status re-fetch reports the failure
    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/api/videos/{id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "failed");
    assert!(body["errorMessage"].as_str().unwrap().contains("moov atom"));
}

#[tokio::test]
async fn thumbnail_failure_still_completes() {
    let prober = FakeProber {
        thumbnail_ok: false,
        ..FakeProber::default()
    };
    let (h, addr) = TestHarness::with_server_prober(prober).await;
    let (_, token) = h.session(Role::Editor, None);

    let id = accepted_id(upload(addr, &token, upload_form("demo", "video/mp4", vec![0u8; 64])).await).await;
    let record = h.wait_terminal(id).await;

    assert_eq!(record.state, ProcessingState::Completed);
    assert!(record.thumbnail_handle.is_none());
    assert_eq!(record.duration_secs, Some(10.0));

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/api/videos/{id}/thumbnail"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn interrupted_records_are_recovered_on_start() {
    let mut config = vg_core::config::Config::default();
    config.processing.stale_after_secs = 0;
    let mut h = TestHarness::build(config, FakeProber::default()).await;
    let owner = vg_core::UserId::new();
    let id = h.uploaded_video(owner, None, "demo", &[5u8; 256], false).await;
    {
        let conn = h.conn();
        let v = h.video(id).version;
        let v = vg_db::queries::videos::begin_processing(&conn, id, v, 10).unwrap();
        vg_db::queries::videos::advance_progress(&conn, id, v, 30).unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    h.start_server().await;
    let record = h.wait_terminal(id).await;
    assert_eq!(record.state, ProcessingState::Completed);
    assert_eq!(record.duration_secs, Some(10.0));
}
