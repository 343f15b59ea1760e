#![forbid(unsafe_code)]

//! HTTP server for vidgrab: accepts a video URL plus quality tier from the
//! bundled front end, walks the format-selector fallback chain through the
//! yt-dlp invoker, and hands the confirmed file back to the browser.
//!
//! Each request downloads into its own subdirectory under the download root
//! so concurrent requests can never clobber each other's files.

use std::{
    env, fs,
    path::{Component, Path, PathBuf},
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, net::TcpListener, signal};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vidgrab::config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use vidgrab::downloader::Downloader;
use vidgrab::policy::{Quality, SiteFamily, plan_attempts};
use vidgrab::translate;

/// Shared state injected into every handler.
///
/// * `engine` is the yt-dlp executable; tests swap in stub scripts.
/// * `counter` numbers per-request download subdirectories.
#[derive(Clone)]
struct AppState {
    download_root: Arc<PathBuf>,
    www_root: Arc<PathBuf>,
    engine: Arc<PathBuf>,
    counter: Arc<AtomicUsize>,
}

impl AppState {
    fn new(download_root: PathBuf, www_root: PathBuf) -> Self {
        Self {
            download_root: Arc::new(download_root),
            www_root: Arc::new(www_root),
            engine: Arc::new(PathBuf::from("yt-dlp")),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Name of a fresh per-request subdirectory. The process id keeps
    /// directories from different server runs apart.
    fn next_request_dir(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("dl-{}-{}", process::id(), seq)
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    title: String,
    file: String,
    is_bilibili: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_overrides<I>(iter: I) -> Result<RuntimeOverrides>
where
    I: IntoIterator<Item = String>,
{
    let mut overrides = RuntimeOverrides::default();
    let mut args = iter.into_iter();
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--port=") {
            overrides.port = Some(parse_port_arg(value)?);
            continue;
        }
        if let Some(value) = arg.strip_prefix("--host=") {
            overrides.host = Some(value.to_string());
            continue;
        }
        if let Some(value) = arg.strip_prefix("--download-root=") {
            overrides.download_root = Some(PathBuf::from(value));
            continue;
        }
        if let Some(value) = arg.strip_prefix("--www-root=") {
            overrides.www_root = Some(PathBuf::from(value));
            continue;
        }
        if let Some(value) = arg.strip_prefix("--log-file=") {
            overrides.log_file = Some(PathBuf::from(value));
            continue;
        }

        match arg.as_str() {
            "--port" => {
                let value = args.next().ok_or_else(|| anyhow!("--port requires a value"))?;
                overrides.port = Some(parse_port_arg(&value)?);
            }
            "--host" => {
                let value = args.next().ok_or_else(|| anyhow!("--host requires a value"))?;
                overrides.host = Some(value);
            }
            "--download-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--download-root requires a value"))?;
                overrides.download_root = Some(PathBuf::from(value));
            }
            "--www-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                overrides.www_root = Some(PathBuf::from(value));
            }
            "--log-file" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("--log-file requires a value"))?;
                overrides.log_file = Some(PathBuf::from(value));
            }
            _ => bail!("unknown argument: {arg}"),
        }
    }
    Ok(overrides)
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn init_logging(log_file: &Path) -> Result<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let overrides = parse_overrides(env::args().skip(1))?;
    let RuntimeConfig {
        download_root,
        www_root,
        log_file,
        port,
        host,
    } = resolve_runtime_config(overrides)?;

    init_logging(&log_file)?;

    fs::create_dir_all(&download_root)
        .with_context(|| format!("creating {}", download_root.display()))?;

    let state = AppState::new(download_root, www_root);

    let app = Router::new()
        .route("/", get(index))
        .route("/assets/{*path}", get(serve_asset))
        .route("/api/download", post(download_video))
        .route("/api/open-folder", post(open_folder))
        .route("/api/get-file/{*path}", get(get_file))
        .with_state(state);

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only affects graceful shutdown; the process still dies on Ctrl+C.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn index(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(state.www_root.join("index.html"), None).await
}

async fn serve_asset(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    let relative = resolve_relative_path(&path)?;
    stream_file(state.www_root.join("assets").join(relative), None).await
}

/// The whole download flow for one request: validate, classify, walk the
/// fallback chain sequentially, verify, respond.
async fn download_video(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = payload
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request(translate::MSG_MISSING_URL))?
        .to_string();
    let quality = Quality::parse(payload.quality.as_deref());
    let family = SiteFamily::classify(&url);
    info!(%url, ?quality, ?family, "new download request");

    let request_dir = state.next_request_dir();
    let downloader = Downloader::new(state.download_root.join(&request_dir))
        .with_program(state.engine.as_ref().clone());
    let attempts = plan_attempts(family, quality);

    let outcome = tokio::task::spawn_blocking(move || {
        let mut last_error = String::new();
        for attempt in &attempts {
            match downloader.run_attempt(&url, attempt, family) {
                Ok(download) => return Ok(download),
                Err(err) => {
                    warn!(label = attempt.label, error = %err, "attempt failed");
                    if !err.trim().is_empty() {
                        last_error = err;
                    }
                }
            }
        }
        Err(last_error)
    })
    .await
    .map_err(|err| {
        error!(%err, "download task aborted unexpectedly");
        ApiError::internal(format!("{}: {err}", translate::MSG_SERVER_FAULT))
    })?;

    match outcome {
        Ok(download) => {
            let file_name = download
                .file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file = format!("{request_dir}/{file_name}");
            info!(%file, title = %download.title, "download request succeeded");
            Ok(Json(DownloadResponse {
                success: true,
                title: download.title,
                file,
                is_bilibili: family.is_bilibili(),
                message: family
                    .is_bilibili()
                    .then(|| translate::MSG_BILIBILI_SUCCESS.to_string()),
            }))
        }
        Err(raw) => {
            let message = translate::translate(Some(&raw));
            error!(error = %message, "all attempts failed");
            Err(ApiError::internal(message))
        }
    }
}

async fn open_folder(State(state): State<AppState>) -> Response {
    match open_download_folder(&state.download_root) {
        Ok(()) => Json(serde_json::json!({"success": true})).into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

#[cfg(target_os = "windows")]
fn open_download_folder(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    process::Command::new("explorer")
        .arg(dir)
        .spawn()
        .context("launching explorer")?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn open_download_folder(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    process::Command::new("open")
        .arg(dir)
        .spawn()
        .context("launching open")?;
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn open_download_folder(dir: &Path) -> Result<()> {
    if env::var_os("DISPLAY").is_none() && env::var_os("WAYLAND_DISPLAY").is_none() {
        bail!("{}", translate::MSG_CANNOT_OPEN_FOLDER);
    }
    fs::create_dir_all(dir)?;
    process::Command::new("xdg-open")
        .arg(dir)
        .spawn()
        .context("launching xdg-open")?;
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn open_download_folder(_dir: &Path) -> Result<()> {
    bail!("{}", translate::MSG_CANNOT_OPEN_FOLDER);
}

async fn get_file(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    let relative = resolve_relative_path(&path)?;
    let target = state.download_root.join(&relative);
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    stream_file(target, Some(&file_name)).await
}

/// Validates that a request path stays inside its base folder.
fn resolve_relative_path(request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let candidate = Path::new(trimmed);
    if trimmed.is_empty()
        || candidate
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(candidate.to_path_buf())
}

async fn stream_file(path: PathBuf, attachment: Option<&str>) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_LENGTH,
        size.to_string().parse().unwrap_or(HeaderValue::from_static("0")),
    );
    if let Ok(value) = mime.to_string().parse() {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = attachment {
        // Header values must be ASCII; titles often are not.
        let value = format!("attachment; filename=\"{}\"", name.replace('"', "'"))
            .parse()
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
