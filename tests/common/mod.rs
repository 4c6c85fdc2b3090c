//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which creates an in-memory DB, a temporary blob
//! store, a scriptable [`FakeProber`], and a full [`AppContext`]. The
//! [`TestHarness::with_server`] constructor runs the real server (router,
//! processor, recovery sweep) on a random port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use vg_av::{MediaProbe, MediaProber};
use vg_core::config::Config;
use vg_core::{Error, ProcessingState, Role, SensitivityVerdict, UserId, VideoId};
use vg_db::models::VideoRecord;
use vg_db::pool::{init_memory_pool, DbPool};
use vg_db::queries::videos::{self, NewVideo};
use vg_server::blob::{BlobNamespace, LocalBlobStore};
use vg_server::classifier::KeywordClassifier;
use vg_server::context::AppContext;
use vg_server::processor::JobReceiver;

/// Scriptable stand-in for ffprobe/ffmpeg.
#[derive(Debug)]
pub struct FakeProber {
    pub available: bool,
    pub probe_error: Option<String>,
    pub thumbnail_ok: bool,
    pub duration_secs: Option<f64>,
    pub probe_calls: AtomicUsize,
}

impl Default for FakeProber {
    fn default() -> Self {
        Self {
            available: true,
            probe_error: None,
            thumbnail_ok: true,
            duration_secs: Some(10.0),
            probe_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeProber {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            probe_error: Some(message.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaProber for FakeProber {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn probe(&self, path: &Path) -> vg_core::Result<MediaProbe> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if !path.exists() {
            return Err(Error::Probe(format!("{} does not exist", path.display())));
        }
        if let Some(ref message) = self.probe_error {
            return Err(Error::Probe(message.clone()));
        }
        Ok(MediaProbe {
            duration_secs: self.duration_secs,
            width: Some(1280),
            height: Some(720),
            codec: Some("h264".into()),
            bitrate: Some(4_000_000),
            has_audio: true,
        })
    }

    async fn thumbnail(&self, _path: &Path, _seek_secs: f64, _width: u32) -> vg_core::Result<Vec<u8>> {
        if self.thumbnail_ok {
            Ok(b"\xff\xd8\xff\xe0fake-jpeg".to_vec())
        } else {
            Err(Error::Thumbnail("could not decode frame".into()))
        }
    }
}

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
    pub db: DbPool,
    pub prober: Arc<FakeProber>,
    jobs: Option<JobReceiver>,
    _blob_dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(Config::default(), FakeProber::default()).await
    }

    pub async fn build(mut config: Config, prober: FakeProber) -> Self {
        let blob_dir = tempfile::tempdir().expect("failed to create blob dir");
        config.server.blob_dir = blob_dir.path().to_path_buf();
        config.auth.token_secret = "integration-test-secret-0123456789abcdef".into();

        let db = init_memory_pool().expect("failed to create in-memory pool");
        let blobs = LocalBlobStore::open_root(blob_dir.path())
            .await
            .expect("failed to open blob store");
        let classifier = KeywordClassifier::new(
            &config.moderation.deny_list,
            0.0,
            StdRng::seed_from_u64(11),
        );
        let prober = Arc::new(prober);

        let (ctx, jobs) = AppContext::new(
            config,
            db.clone(),
            Arc::new(blobs),
            prober.clone(),
            Arc::new(classifier),
        );

        Self {
            ctx,
            db,
            prober,
            jobs: Some(jobs),
            _blob_dir: blob_dir,
        }
    }

    /// Start the full server with the default fake prober.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::with_server_prober(FakeProber::default()).await
    }

    /// Start the full server on a random port.
    pub async fn with_server_prober(prober: FakeProber) -> (Self, SocketAddr) {
        let mut harness = Self::build(Config::default(), prober).await;
        let addr = harness.start_server().await;
        (harness, addr)
    }

    /// Run the server (recovery sweep, processor, router) for this harness.
    pub async fn start_server(&mut self) -> SocketAddr {
        let jobs = self.jobs.take().expect("server already started");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            vg_server::run(ctx, jobs, listener).await.ok();
        });

        addr
    }

    /// Get a database connection from the pool.
    pub fn conn(&self) -> vg_db::pool::PooledConnection {
        vg_db::pool::get_conn(&self.db).expect("failed to get db connection")
    }

    /// Sign a session credential for a fresh user.
    pub fn session(&self, role: Role, org: Option<&str>) -> (UserId, String) {
        let user = UserId::new();
        (user, self.session_for(user, role, org))
    }

    pub fn session_for(&self, user: UserId, role: Role, org: Option<&str>) -> String {
        self.ctx
            .tokens
            .issue_session(user, role, org.map(String::from), 3600)
            .expect("failed to sign session")
    }

    pub fn video(&self, id: VideoId) -> VideoRecord {
        videos::get_video(&self.conn(), id)
            .expect("query failed")
            .expect("video missing")
    }

    /// Insert a record with `data` as its media, already `completed`.
    pub async fn completed_video(
        &self,
        owner: UserId,
        org: Option<&str>,
        data: &[u8],
        verdict: SensitivityVerdict,
    ) -> VideoId {
        let id = self.uploaded_video(owner, org, "fixture", data, false).await;
        let conn = self.conn();
        let record = self.video(id);
        let v = videos::begin_processing(&conn, id, record.version, 10).unwrap();
        videos::advance_progress(&conn, id, v, 100).unwrap();
        videos::set_verdict_if_pending(&conn, id, verdict).unwrap();
        id
    }

    /// Insert a record in `uploading` without scheduling it.
    pub async fn uploaded_video(
        &self,
        owner: UserId,
        org: Option<&str>,
        title: &str,
        data: &[u8],
        is_public: bool,
    ) -> VideoId {
        let blob = self
            .ctx
            .blobs
            .save_bytes(BlobNamespace::Videos, "mp4", data)
            .await
            .expect("failed to store blob");
        videos::create_video(
            &self.conn(),
            &NewVideo {
                owner_id: owner,
                organization: org,
                title,
                description: None,
                tags: &[],
                original_filename: "fixture.mp4",
                blob_handle: &blob.handle,
                byte_size: data.len() as i64,
                mime_type: "video/mp4",
                is_public,
            },
        )
        .expect("failed to create video")
        .id
    }

    /// Poll until the record reaches a terminal state.
    pub async fn wait_terminal(&self, id: VideoId) -> VideoRecord {
        for _ in 0..200 {
            let record = self.video(id);
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("video {id} never reached a terminal state");
    }

    /// Number of files currently in the `videos/` namespace.
    pub fn stored_video_count(&self) -> usize {
        std::fs::read_dir(self._blob_dir.path().join("videos"))
            .map(|rd| rd.count())
            .unwrap_or(0)
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

/// Build a multipart upload form.
pub fn upload_form(title: &str, mime: &str, data: Vec<u8>) -> reqwest::multipart::Form {
    let part = reqwest::multipart::Part::bytes(data)
        .file_name("clip.mp4")
        .mime_str(mime)
        .expect("valid mime");
    reqwest::multipart::Form::new()
        .text("title", title.to_string())
        .text("description", "integration fixture")
        .part("file", part)
}

/// POST an upload and return the response.
pub async fn upload(
    addr: SocketAddr,
    token: &str,
    form: reqwest::multipart::Form,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/api/videos"))
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await
        .expect("upload request failed")
}

/// Extract the record id from a 202 upload response.
pub async fn accepted_id(resp: reqwest::Response) -> VideoId {
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "uploading");
    body["recordId"].as_str().unwrap().parse().unwrap()
}

pub fn assert_state(record: &VideoRecord, state: ProcessingState) {
    assert_eq!(record.state, state, "unexpected state for {}", record.id);
}
