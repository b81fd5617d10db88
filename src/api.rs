//! HTTP surface: request validation and orchestration of extractor, encoder and store.

use std::{net::SocketAddr, path::Path as FsPath, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::{
    config::non_empty,
    encoder::AudioEncoder,
    error::{Error, Result},
    event_log::{Event, EventSink, EventType},
    extractor::{MediaExtractor, MediaInfo},
    formats::{StreamView, selected_resolution, stream_views},
    store::{Allocation, Artifact, ArtifactStore},
};

const DEFAULT_AUDIO_SELECTOR: &str = "bestaudio/best";
const MAX_SELECTOR_LEN: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub extractor: Arc<dyn MediaExtractor>,
    pub encoder: Arc<dyn AudioEncoder>,
    pub events: Arc<dyn EventSink>,
    pub download_semaphore: Arc<Semaphore>,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(
        store: Arc<ArtifactStore>,
        extractor: Arc<dyn MediaExtractor>,
        encoder: Arc<dyn AudioEncoder>,
        events: Arc<dyn EventSink>,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            encoder,
            events,
            download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            trust_proxy_headers: false,
        }
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(video_info))
        .route("/api/download", post(download_video))
        .route("/api/convert-to-mp3", post(convert_to_mp3))
        .route("/api/file/{token}", get(get_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaRequest {
    pub url: Option<String>,
    pub format_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub title: String,
    pub author: String,
    pub length_seconds: u64,
    pub thumbnail_url: String,
    pub streams: Vec<StreamView>,
    pub video_id: String,
    pub mp3_available: bool,
}

#[derive(Debug, Serialize)]
pub struct FileLinkResponse {
    pub download_url: String,
    pub filename: String,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "mp3_available": state.encoder.available() }))
}

async fn video_info(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: std::result::Result<Json<MediaRequest>, JsonRejection>,
) -> Result<Json<InfoResponse>> {
    let client_ip = client_ip_for_request(state.trust_proxy_headers, &headers, addr);
    let request = parse_payload(payload);
    let raw_url = raw_url(&request);

    let result = async {
        let request = request?;
        let url = required_url(request.url.as_deref())?;
        let info = state.extractor.query(&url).await?;
        Ok::<_, Error>(build_info_response(info, state.encoder.available()))
    }
    .await;

    match result {
        Ok(response) => {
            let event = Event::success(EventType::InfoRequest)
                .ip(&client_ip)
                .details(json!({
                    "video_id": response.video_id,
                    "title": response.title,
                    "stream_count": response.streams.len(),
                }));
            state.events.record(with_url(event, raw_url.as_deref())).await;
            Ok(Json(response))
        }
        Err(error) => {
            record_failure(&state, EventType::InfoRequest, raw_url.as_deref(), &client_ip, &error)
                .await;
            Err(error)
        }
    }
}

async fn download_video(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: std::result::Result<Json<MediaRequest>, JsonRejection>,
) -> Result<Json<FileLinkResponse>> {
    let client_ip = client_ip_for_request(state.trust_proxy_headers, &headers, addr);
    let request = parse_payload(payload);
    let raw_url = raw_url(&request);

    let result = async {
        let request = request?;
        let url = required_url(request.url.as_deref())?;
        let format_id = request
            .format_id
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| Error::InvalidRequest("URL y format_id son obligatorios.".to_string()))
            .and_then(format_selector)?;

        let produced = run_job(state.clone(), url, format_id.clone(), false).await?;
        Ok::<_, Error>((format_id, produced))
    }
    .await;

    match result {
        Ok((format_id, produced)) => {
            let event = Event::success(EventType::DownloadRequest)
                .ip(&client_ip)
                .details(json!({
                    "video_id": video_id(&produced.info),
                    "title": title(&produced.info),
                    "format_id": format_id,
                    "resolution": selected_resolution(&produced.info.formats, &format_id),
                    "file_size_mb": produced.artifact.size_mb(),
                }));
            state.events.record(with_url(event, raw_url.as_deref())).await;

            Ok(Json(FileLinkResponse {
                download_url: download_url(&produced.artifact),
                filename: produced
                    .info
                    .title
                    .clone()
                    .unwrap_or_else(|| "video".to_string()),
            }))
        }
        Err(error) => {
            record_failure(
                &state,
                EventType::DownloadRequest,
                raw_url.as_deref(),
                &client_ip,
                &error,
            )
            .await;
            Err(error)
        }
    }
}

async fn convert_to_mp3(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: std::result::Result<Json<MediaRequest>, JsonRejection>,
) -> Result<Json<FileLinkResponse>> {
    let client_ip = client_ip_for_request(state.trust_proxy_headers, &headers, addr);
    let request = parse_payload(payload);
    let raw_url = raw_url(&request);

    let result = async {
        let request = request?;
        let url = required_url(request.url.as_deref())?;
        if !state.encoder.available() {
            return Err(Error::EncoderUnavailable);
        }

        let selector = match request.format_id.as_deref().and_then(non_empty) {
            Some(format_id) => format_selector(format_id)?,
            None => DEFAULT_AUDIO_SELECTOR.to_string(),
        };

        run_job(state.clone(), url, selector, true).await
    }
    .await;

    match result {
        Ok(produced) => {
            let event = Event::success(EventType::Mp3Conversion)
                .ip(&client_ip)
                .details(json!({
                    "video_id": video_id(&produced.info),
                    "title": title(&produced.info),
                    "file_size_mb": produced.artifact.size_mb(),
                }));
            state.events.record(with_url(event, raw_url.as_deref())).await;

            let base = produced.info.title.as_deref().unwrap_or("audio");
            Ok(Json(FileLinkResponse {
                download_url: download_url(&produced.artifact),
                filename: format!("{base}.mp3"),
            }))
        }
        Err(error) => {
            record_failure(
                &state,
                EventType::Mp3Conversion,
                raw_url.as_deref(),
                &client_ip,
                &error,
            )
            .await;
            Err(error)
        }
    }
}

async fn get_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Response> {
    let client_ip = client_ip_for_request(state.trust_proxy_headers, &headers, addr);

    let result = async {
        let artifact = state.store.resolve(&token).await?;
        // The sweep may win the race between resolve and open.
        let file = tokio::fs::File::open(&artifact.path)
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound,
                _ => Error::storage("No se pudo leer el archivo", error),
            })?;
        let content_length = file
            .metadata()
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(artifact.size_bytes);
        Ok::<_, Error>((artifact, file, content_length))
    }
    .await;

    let (artifact, file, content_length) = match result {
        Ok(opened) => opened,
        Err(error) => {
            let event = Event::error(EventType::FileAccess, format!("File not found: {token}"))
                .ip(&client_ip);
            state.events.record(event).await;
            return Err(error);
        }
    };

    state
        .events
        .record(
            Event::success(EventType::FileAccess)
                .ip(&client_ip)
                .details(json!({ "filename": artifact.file_name })),
        )
        .await;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&artifact.file_name)),
    );
    response_headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string())
            .map_err(|_| Error::Storage("No se pudo crear el tamano de descarga.".to_string()))?,
    );
    response_headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&artifact.file_name))
            .map_err(|_| Error::Storage("No se pudo crear la cabecera de descarga.".to_string()))?,
    );
    response_headers.insert(
        HeaderName::from_static("x-download-filename"),
        HeaderValue::from_str(&sanitize_ascii_filename(&artifact.file_name))
            .map_err(|_| Error::Storage("No se pudo crear el nombre del archivo.".to_string()))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((response_headers, body).into_response())
}

struct Produced {
    info: MediaInfo,
    artifact: Artifact,
}

/// Runs download (and optional conversion) in its own task, so a client that disconnects
/// mid-request does not skip the cleanup of a failed namespace.
async fn run_job(state: AppState, url: String, selector: String, to_audio: bool) -> Result<Produced> {
    let task = tokio::spawn(async move {
        let _permit = state
            .download_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Storage("No se pudo reservar capacidad de descarga.".to_string()))?;

        let allocation = state.store.allocate().await?;
        let result = produce(&state, &allocation, &url, &selector, to_audio).await;

        match &result {
            Ok(produced) => info!(
                "Descarga {} lista: {} ({} bytes)",
                allocation.token, produced.artifact.file_name, produced.artifact.size_bytes
            ),
            Err(error) => {
                warn!("Descarga {} fallida: {error}", allocation.token);
                state.store.discard(&allocation.token).await;
            }
        }

        result
    });

    task.await
        .map_err(|error| Error::Storage(format!("La tarea de descarga termino de forma inesperada: {error}")))?
}

async fn produce(
    state: &AppState,
    allocation: &Allocation,
    url: &str,
    selector: &str,
    to_audio: bool,
) -> Result<Produced> {
    let info = state
        .extractor
        .download(url, selector, &allocation.dir)
        .await?;
    let artifact = state.store.finalize(&allocation.token).await?;

    if !to_audio {
        return Ok(Produced { info, artifact });
    }

    let file_name = format!("{}.mp3", file_stem(&artifact.file_name));
    let staging = state.store.staging_path(&allocation.token, &file_name);
    state
        .encoder
        .transcode_to_audio(&artifact.path, &staging)
        .await?;
    let artifact = state
        .store
        .replace(&allocation.token, &staging, &file_name)
        .await?;

    Ok(Produced { info, artifact })
}

fn parse_payload(
    payload: std::result::Result<Json<MediaRequest>, JsonRejection>,
) -> Result<MediaRequest> {
    payload
        .map(|Json(request)| request)
        .map_err(|rejection| {
            Error::InvalidRequest(format!(
                "Cuerpo de la peticion invalido: {}",
                rejection.body_text()
            ))
        })
}

fn raw_url(request: &Result<MediaRequest>) -> Option<String> {
    request
        .as_ref()
        .ok()
        .and_then(|request| request.url.as_deref())
        .and_then(non_empty)
        .map(ToString::to_string)
}

fn required_url(value: Option<&str>) -> Result<String> {
    let url = value
        .and_then(non_empty)
        .ok_or_else(|| Error::InvalidRequest("La URL es obligatoria.".to_string()))?;

    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some() => {
            Ok(url.to_string())
        }
        _ => Err(Error::InvalidRequest(format!(
            "URL invalida: {url}. Usa una direccion http o https."
        ))),
    }
}

/// Accepts any yt-dlp format selector expression (`22`, `bestaudio/best`,
/// `bv*[height<=720]+ba`), but nothing that could be read as a command-line flag.
fn format_selector(value: &str) -> Result<String> {
    let value = value.trim();
    let valid = !value.is_empty()
        && value.len() <= MAX_SELECTOR_LEN
        && !value.starts_with('-')
        && !value.chars().any(char::is_control);

    if valid {
        Ok(value.to_string())
    } else {
        Err(Error::InvalidRequest(format!(
            "format_id invalido: {value:?}"
        )))
    }
}

async fn record_failure(
    state: &AppState,
    event_type: EventType,
    url: Option<&str>,
    client_ip: &str,
    error: &Error,
) {
    let event = Event::error(event_type, error.to_string()).ip(client_ip);
    state.events.record(with_url(event, url)).await;
}

fn with_url(event: Event, url: Option<&str>) -> Event {
    match url {
        Some(url) => event.url(url),
        None => event,
    }
}

fn build_info_response(info: MediaInfo, mp3_available: bool) -> InfoResponse {
    let streams = stream_views(&info.formats);

    InfoResponse {
        title: title(&info),
        author: info.uploader.unwrap_or_else(|| "Unknown".to_string()),
        length_seconds: info
            .duration
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(|seconds| seconds.round() as u64)
            .unwrap_or(0),
        thumbnail_url: info.thumbnail.unwrap_or_default(),
        streams,
        video_id: video_id_or_unknown(info.id),
        mp3_available,
    }
}

fn title(info: &MediaInfo) -> String {
    info.title.clone().unwrap_or_else(|| "Unknown".to_string())
}

fn video_id(info: &MediaInfo) -> String {
    video_id_or_unknown(info.id.clone())
}

fn video_id_or_unknown(id: Option<String>) -> String {
    id.unwrap_or_else(|| "unknown".to_string())
}

fn download_url(artifact: &Artifact) -> String {
    format!("/api/file/{}", artifact.token)
}

fn file_stem(file_name: &str) -> String {
    FsPath::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(non_empty)
        .unwrap_or("audio")
        .to_string()
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    if trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_url_rejects_missing_and_non_http() {
        assert!(matches!(required_url(None), Err(Error::InvalidRequest(_))));
        assert!(matches!(required_url(Some("   ")), Err(Error::InvalidRequest(_))));
        assert!(matches!(
            required_url(Some("file:///etc/passwd")),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(
            required_url(Some(" https://youtu.be/abc ")).unwrap(),
            "https://youtu.be/abc"
        );
    }

    #[test]
    fn format_selector_keeps_expressions_but_rejects_flags() {
        assert_eq!(format_selector("bestaudio/best").unwrap(), "bestaudio/best");
        assert_eq!(
            format_selector("bv*[height<=720]+ba").unwrap(),
            "bv*[height<=720]+ba"
        );
        assert!(format_selector("--exec rm").is_err());
        assert!(format_selector("22\n--exec").is_err());
        assert!(format_selector(&"1".repeat(MAX_SELECTOR_LEN + 1)).is_err());
    }

    #[test]
    fn content_disposition_has_ascii_fallback_and_utf8_name() {
        let header = build_content_disposition("Canción bonita.mp3");
        assert_eq!(
            header,
            "attachment; filename=\"Canci_n bonita.mp3\"; filename*=UTF-8''Canci%C3%B3n%20bonita.mp3"
        );
        assert!(HeaderValue::from_str(&header).is_ok());
    }

    #[test]
    fn sanitize_falls_back_for_empty_names() {
        assert_eq!(sanitize_ascii_filename("   "), "download.bin");
        assert_eq!(sanitize_ascii_filename("a/b\"c.mp4"), "a_b_c.mp4");
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for_filename("x.MP3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("x.webm"), "video/webm");
        assert_eq!(content_type_for_filename("x"), "application/octet-stream");
    }

    #[test]
    fn client_ip_uses_proxy_headers_only_when_trusted() {
        let addr: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));

        assert_eq!(client_ip_for_request(false, &headers, addr), "10.0.0.5");
        assert_eq!(client_ip_for_request(true, &headers, addr), "203.0.113.7");
        assert_eq!(client_ip_for_request(true, &HeaderMap::new(), addr), "10.0.0.5");
    }

    #[test]
    fn file_stem_drops_only_the_last_extension() {
        assert_eq!(file_stem("My.Talk.webm"), "My.Talk");
        assert_eq!(file_stem("noext"), "noext");
    }

    #[test]
    fn info_response_fills_missing_metadata() {
        let response = build_info_response(MediaInfo::default(), false);

        assert_eq!(response.title, "Unknown");
        assert_eq!(response.author, "Unknown");
        assert_eq!(response.length_seconds, 0);
        assert_eq!(response.thumbnail_url, "");
        assert_eq!(response.video_id, "unknown");
        assert!(response.streams.is_empty());
        assert!(!response.mp3_available);
    }
}
