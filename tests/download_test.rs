// Integration tests for the download API: route shapes, headers, image
// inclusion policy, and the persistent image cache.

use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::net::TcpListener;

use transporter::config::Config;
use transporter::engine::{Assembler, DockerEngine};
use transporter::server::DownloadServer;
use transporter::store::{JobRecord, JobStatus, MemoryStore};

/// Minimal but valid container image save-format: a tar with a manifest,
/// a config blob, and one layer.
fn image_fixture() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let manifest =
        br#"[{"Config":"0afe.json","RepoTags":["compendium:job-1"],"Layers":["layer.tar"]}]"#;
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(manifest.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header.clone(), "manifest.json", &manifest[..])
        .unwrap();
    let config = br#"{"architecture":"amd64","os":"linux"}"#;
    header.set_size(config.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header.clone(), "0afe.json", &config[..])
        .unwrap();
    let layer = vec![0x42u8; 2048];
    header.set_size(layer.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, "layer.tar", &layer[..])
        .unwrap();
    builder.into_inner().unwrap()
}

async fn engine_inspect(AxPath(tag): AxPath<String>) -> impl IntoResponse {
    Json(json!({
        "Id": "sha256:deadbeef",
        "Size": 2048,
        "RepoTags": [tag],
    }))
}

async fn engine_export(
    State(fetches): State<Arc<AtomicUsize>>,
    AxPath(tag): AxPath<String>,
) -> Response {
    if !tag.starts_with("compendium:") {
        return (StatusCode::NOT_FOUND, "no such image").into_response();
    }
    fetches.fetch_add(1, Ordering::SeqCst);
    image_fixture().into_response()
}

struct TestRig {
    server: DownloadServer,
    config: Arc<Config>,
    store: Arc<MemoryStore>,
    fetches: Arc<AtomicUsize>,
    _base_dir: tempfile::TempDir,
}

/// Start a fake container engine plus the download server on random ports.
async fn start_rig() -> TestRig {
    let fetches = Arc::new(AtomicUsize::new(0));
    let engine_app = Router::new()
        .route("/images/{tag}/json", get(engine_inspect))
        .route("/images/{tag}/get", get(engine_export))
        .with_state(fetches.clone());
    let engine_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_port = engine_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(engine_listener, engine_app).await.ok();
    });

    let base_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.base_path = base_dir.path().to_path_buf();
    config.compendium_path = base_dir.path().join("compendium");
    config.docker_host = format!("http://127.0.0.1:{}", engine_port);
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.compendium_path)
        .await
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(DockerEngine::new(&config.docker_host));
    let assembler = Arc::new(Assembler::new(
        Arc::clone(&config),
        store.clone(),
        store.clone(),
        engine,
    ));
    let server = DownloadServer::start(assembler).await.unwrap();

    TestRig {
        server,
        config,
        store,
        fetches,
        _base_dir: base_dir,
    }
}

async fn seed_compendium(rig: &TestRig, id: &str) {
    rig.store.add_compendium(id);
    let dir = rig.config.compendium_dir(id);
    tokio::fs::create_dir_all(dir.join("data")).await.unwrap();
    tokio::fs::write(dir.join("bagit.txt"), b"BagIt-Version: 0.97\n")
        .await
        .unwrap();
    tokio::fs::write(dir.join("data/bagtainer.yml"), b"command: runit\n")
        .await
        .unwrap();
    tokio::fs::write(dir.join("data/test.txt"), b"this is a test file\n")
        .await
        .unwrap();
}

fn seed_job(rig: &TestRig, compendium: &str, job: &str, status: JobStatus, minute: u32) {
    rig.store.add_job(JobRecord {
        id: job.to_string(),
        compendium_id: compendium.to_string(),
        status,
        updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
    });
}

fn tar_entry_names(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn unknown_id_is_404_with_message_on_every_route() {
    let rig = start_rig().await;
    let client = reqwest::Client::new();

    // "1234" exists nowhere; .tar.gz follows the redirect and still 404s.
    for filename in ["1234.zip", "1234.tar", "1234.tar.gz"] {
        let resp = client
            .get(rig.server.url_for(filename))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404, "route {}", filename);
        let body = resp.text().await.unwrap();
        assert!(body.contains("no compendium"), "body was {}", body);
    }

    rig.server.shutdown();
}

#[tokio::test]
async fn zip_download_round_trips_the_tree() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    let client = reqwest::Client::new();

    let resp = client
        .get(rig.server.url_for("abcd.zip?image=false"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/zip"
    );
    assert_eq!(
        resp.headers().get("content-disposition").unwrap(),
        "attachment; filename=\"abcd.zip\""
    );

    let bytes = resp.bytes().await.unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    assert!(names.contains(&"bagit.txt".to_string()));
    assert!(names.contains(&"data/".to_string()));
    assert!(names.contains(&"data/test.txt".to_string()));
    assert!(!names.iter().any(|n| n.contains("image.tar")));

    let mut content = String::new();
    archive
        .by_name("data/test.txt")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "this is a test file\n");

    // Provenance comment embeds the requesting URL.
    let comment = String::from_utf8_lossy(archive.comment()).to_string();
    assert!(comment.contains("Created by transporter [http://127.0.0.1"));
    assert!(comment.contains("abcd.zip"));

    rig.server.shutdown();
}

#[tokio::test]
async fn image_is_included_exactly_once_and_fetched_once() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    seed_job(&rig, "abcd", "job-1", JobStatus::Success, 0);
    let client = reqwest::Client::new();

    // 1. First download with image: engine is hit once, tarball lands in
    //    the archive exactly once.
    let resp = client
        .get(rig.server.url_for("abcd.tar?image=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/x-tar"
    );
    let bytes = resp.bytes().await.unwrap();
    let names = tar_entry_names(&bytes);
    assert_eq!(names.iter().filter(|n| *n == "image.tar").count(), 1);
    assert_eq!(rig.fetches.load(Ordering::SeqCst), 1);

    // 2. The embedded bytes are the engine's save-format tar.
    let mut archive = tar::Archive::new(Cursor::new(bytes.to_vec()));
    let mut image_bytes = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == "image.tar" {
            entry.read_to_end(&mut image_bytes).unwrap();
        }
    }
    assert_eq!(image_bytes, image_fixture());
    let inner_names = tar_entry_names(&image_bytes);
    assert!(inner_names.contains(&"manifest.json".to_string()));
    assert!(inner_names.contains(&"layer.tar".to_string()));

    // 3. The artifact is a persistent cache: a second download must not
    //    re-fetch from the engine.
    let resp = client
        .get(rig.server.url_for("abcd.tar?image=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.bytes().await.unwrap();
    assert_eq!(rig.fetches.load(Ordering::SeqCst), 1);
    let artifact = rig.config.artifact_path(&rig.config.compendium_dir("abcd"));
    assert!(artifact.is_file());

    // 4. image=false excludes the cached file by name even though it is on
    //    disk now.
    let resp = client
        .get(rig.server.url_for("abcd.tar?image=false"))
        .send()
        .await
        .unwrap();
    let names = tar_entry_names(&resp.bytes().await.unwrap());
    assert!(!names.contains(&"image.tar".to_string()));

    rig.server.shutdown();
}

#[tokio::test]
async fn image_is_included_by_default() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    seed_job(&rig, "abcd", "job-1", JobStatus::Success, 0);
    let client = reqwest::Client::new();

    let resp = client
        .get(rig.server.url_for("abcd.tar"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let names = tar_entry_names(&resp.bytes().await.unwrap());
    assert!(names.contains(&"image.tar".to_string()));

    rig.server.shutdown();
}

#[tokio::test]
async fn tar_gz_redirect_matches_tar_gzip_byte_for_byte() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    let no_redirect = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    // 1. The sugar route redirects, preserving the other query params.
    let resp = no_redirect
        .get(rig.server.url_for("abcd.tar.gz?image=false"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        "/api/v1/compendium/abcd.tar?gzip&image=false"
    );

    // 2. Following it lands on the gzipped tar with the right headers.
    let gz_url = rig.server.url_for("abcd.tar?gzip&image=false");
    let resp = no_redirect.get(&gz_url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        resp.headers().get("content-disposition").unwrap(),
        "attachment; filename=\"abcd.tar.gz\""
    );
    let first = resp.bytes().await.unwrap();

    // 3. Same bytes again through the redirect chain.
    let followed = reqwest::Client::new()
        .get(rig.server.url_for("abcd.tar.gz?image=false"))
        .send()
        .await
        .unwrap();
    let second = followed.bytes().await.unwrap();
    assert_eq!(first, second);

    // 4. Decompressed payload equals the plain tar route.
    let mut decompressed = Vec::new();
    flate2::read::GzDecoder::new(Cursor::new(first.to_vec()))
        .read_to_end(&mut decompressed)
        .unwrap();
    let plain = reqwest::Client::new()
        .get(rig.server.url_for("abcd.tar?image=false"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(decompressed, plain.to_vec());

    rig.server.shutdown();
}

#[tokio::test]
async fn image_without_job_is_a_clean_500_and_leaves_the_tree_alone() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    let client = reqwest::Client::new();

    let resp = client
        .get(rig.server.url_for("abcd.zip?image=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "no job found for this compendium, run a job before downloading with image"
    );
    assert_eq!(rig.fetches.load(Ordering::SeqCst), 0);

    // Nothing was materialized or left behind in the compendium directory.
    let dir = rig.config.compendium_dir("abcd");
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    assert_eq!(names, vec!["bagit.txt", "data"]);

    rig.server.shutdown();
}

#[tokio::test]
async fn in_progress_image_download_is_never_archived() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    // A partial file as left by a materialization that is still running
    // (or died) in another request.
    let dir = rig.config.compendium_dir("abcd");
    tokio::fs::write(dir.join("image.tar.partial"), b"half an image")
        .await
        .unwrap();

    let resp = reqwest::Client::new()
        .get(rig.server.url_for("abcd.tar?image=false"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let names = tar_entry_names(&resp.bytes().await.unwrap());
    assert!(!names.iter().any(|n| n.contains("partial")), "{:?}", names);

    rig.server.shutdown();
}

#[tokio::test]
async fn empty_image_param_keeps_the_configured_default() {
    let rig = start_rig().await;
    seed_compendium(&rig, "abcd").await;
    let client = reqwest::Client::new();

    // With no job and the default include-image of true, an `image=` that
    // carries no value must still take the image path and fail cleanly,
    // not silently switch the image off.
    let resp = client
        .get(rig.server.url_for("abcd.tar?image="))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("no job"));

    rig.server.shutdown();
}

#[tokio::test]
async fn status_endpoint_reports_the_service() {
    let rig = start_rig().await;
    let url = format!(
        "http://127.0.0.1:{}/status",
        rig.server.port()
    );
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["service"], "transporter");
    assert!(body["version"].as_str().is_some());

    rig.server.shutdown();
}
