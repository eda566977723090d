// Axum request handler: translates download HTTP requests into archive
// assembly operations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::archive::ArchiveFormat;
use crate::config::API_PREFIX;
use crate::engine::assembly::{ArchiveRequest, Assembler, AssemblyError};
use crate::engine::materializer::MaterializeError;

const NO_COMPENDIUM_MSG: &str = "no compendium with this id";
const NO_JOB_MSG: &str = "no job found for this compendium, run a job before downloading with image";
const JOB_LOOKUP_MSG: &str = "error finding last job for compendium";

pub struct DownloadServer {
    port: u16,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl DownloadServer {
    /// Bind the configured address and serve downloads until `shutdown`.
    /// With port 0 the OS picks one; `port()` reports the actual value.
    pub async fn start(assembler: Arc<Assembler>) -> Result<Self> {
        let addr = format!(
            "{}:{}",
            assembler.config().host,
            assembler.config().port
        );
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route(
                &format!("{}/compendium/{{filename}}", API_PREFIX),
                get(download_handler),
            )
            .route("/status", get(status_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(assembler);

        info!("download server listening on {} (port {})", addr, port);
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build a download URL for a compendium filename such as `abcd.zip`.
    pub fn url_for(&self, filename: &str) -> String {
        format!(
            "http://127.0.0.1:{}{}/compendium/{}",
            self.port, API_PREFIX, filename
        )
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DownloadRoute {
    Zip { id: String },
    Tar { id: String },
    TarGz { id: String },
}

/// Split `<id>.<ext>` into the compendium id and archive shape. The longer
/// `.tar.gz` suffix must win over `.tar`. Ids are restricted to filename-safe
/// characters so they can be embedded into headers verbatim.
fn parse_download_filename(filename: &str) -> Option<DownloadRoute> {
    let (id, route) = if let Some(id) = filename.strip_suffix(".tar.gz") {
        (id, DownloadRoute::TarGz { id: id.to_string() })
    } else if let Some(id) = filename.strip_suffix(".tar") {
        (id, DownloadRoute::Tar { id: id.to_string() })
    } else if let Some(id) = filename.strip_suffix(".zip") {
        (id, DownloadRoute::Zip { id: id.to_string() })
    } else {
        return None;
    };
    if !valid_id(id) {
        return None;
    }
    Some(route)
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// `image` is only honored when it carries a value, and only the literal
/// `true` switches it on. A bare `?image` or `?image=` keeps the configured
/// default.
fn include_image_param(params: &HashMap<String, String>) -> Option<bool> {
    params
        .get("image")
        .filter(|value| !value.is_empty())
        .map(|value| value == "true")
}

/// Location for the `.tar.gz` sugar route: same id as `.tar?gzip`, original
/// query carried over behind it.
fn redirect_location(id: &str, raw_query: Option<&str>) -> String {
    let mut location = format!("{}/compendium/{}.tar?gzip", API_PREFIX, id);
    if let Some(query) = raw_query {
        if !query.is_empty() {
            location.push('&');
            location.push_str(query);
        }
    }
    location
}

/// Reconstructs the request URL for provenance metadata. Scheme honors a
/// proxy's x-forwarded-proto; everything else comes from the Host header.
fn origin_url(headers: &HeaderMap, path_and_query: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}{}", scheme, host, path_and_query)
}

fn not_found_response() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": NO_COMPENDIUM_MSG })),
    )
        .into_response()
}

/// Pre-stream failures still own the status line; map them to the JSON
/// bodies the API promises. Raw detail only leaks when configured.
fn error_response(err: &AssemblyError, debug_errors: bool) -> Response {
    match err {
        AssemblyError::NotFound => not_found_response(),
        AssemblyError::Materialize(MaterializeError::NoJob) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": NO_JOB_MSG })),
        )
            .into_response(),
        AssemblyError::Materialize(MaterializeError::Store(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": JOB_LOOKUP_MSG })),
        )
            .into_response(),
        other => {
            let body = if debug_errors {
                json!({ "error": "internal error", "detail": other.to_string() })
            } else {
                json!({ "error": "internal error" })
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

/// GET /api/v1/compendium/{filename}: stream a compendium as an archive.
async fn download_handler(
    State(assembler): State<Arc<Assembler>>,
    Path(filename): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let route = match parse_download_filename(&filename) {
        Some(route) => route,
        None => {
            warn!("unparseable download filename {:?}", filename);
            return not_found_response();
        }
    };

    let (id, format, gzip) = match route {
        DownloadRoute::TarGz { id } => {
            let location = redirect_location(&id, raw_query.as_deref());
            return (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
        }
        DownloadRoute::Zip { id } => (id, ArchiveFormat::Zip, false),
        DownloadRoute::Tar { id } => {
            let gzip = params.contains_key("gzip");
            (id, ArchiveFormat::Tar, gzip)
        }
    };

    let path_and_query = match &raw_query {
        Some(query) => format!("{}/compendium/{}?{}", API_PREFIX, filename, query),
        None => format!("{}/compendium/{}", API_PREFIX, filename),
    };
    let request = ArchiveRequest {
        compendium_id: id,
        format,
        gzip,
        include_image: include_image_param(&params),
        origin: origin_url(&headers, &path_and_query),
    };

    let debug_errors = assembler.config().debug_errors;
    match assembler.assemble(request).await {
        Ok(stream) => {
            let mut resp_headers = HeaderMap::new();
            resp_headers.insert(header::CONTENT_TYPE, stream.content_type.parse().unwrap());
            resp_headers.insert(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", stream.filename)
                    .parse()
                    .unwrap(),
            );
            let body = Body::from_stream(ReceiverStream::new(stream.body));
            (StatusCode::OK, resp_headers, body).into_response()
        }
        Err(err) => {
            error!("archive assembly failed: {}", err);
            error_response(&err, debug_errors)
        }
    }
}

/// GET /status: liveness and basic configuration echo.
async fn status_handler(State(assembler): State<Arc<Assembler>>) -> Response {
    let config = assembler.config();
    Json(json!({
        "service": config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "compendium_path": config.compendium_path.display().to_string(),
    }))
    .into_response()
}
