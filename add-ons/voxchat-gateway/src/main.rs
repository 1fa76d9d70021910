//! voxchat gateway: voice profile training, spoken chat and reply download over HTTP.
//!
//! Routes:
//! - `POST /train-model`        multipart `model_name` + repeated `voice_samples`, 303 → `/voices`
//! - `POST /upload-audio`       multipart `audio`, `emotion`, `voice_id`, `prompt-template`
//! - `GET  /get-audio/:filename` synthesized reply as `audio/wav`
//! - `GET  /voices`             registered profile names
//! - `GET  /health`

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxchat_core::{
    AppConfig, ChatOrchestrator, ChatRequest, Persona, PipelineError, SampleUpload, StageFailure,
};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<ChatOrchestrator>,
    response_dir: PathBuf,
}

impl AppState {
    fn new(orchestrator: ChatOrchestrator) -> Self {
        let response_dir = orchestrator.synthesis().response_dir().to_path_buf();
        Self {
            orchestrator: Arc::new(orchestrator),
            response_dir,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[voxchat-gateway] .env not loaded: {} (using system environment)", e);
    }

    let config = AppConfig::load()?;
    config.ensure_dirs()?;
    let _log_guard = init_tracing(&config);

    if config.llm.api_key.is_none() {
        warn!(target: "voxchat::gateway", "No LLM API key (llm.api_key / OPENROUTER_API_KEY); every reply will be the fallback");
    }

    let orchestrator = ChatOrchestrator::from_config(&config)?;
    let app = build_app(AppState::new(orchestrator), config.max_upload_bytes);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(target: "voxchat::gateway", "voxchat gateway listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// stdout always; a daily-rolling file too when `log_dir` is configured. Keep the guard alive.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "voxchat-gateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn build_app(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/voices", get(list_voices))
        .route("/train-model", post(train_model))
        .route("/upload-audio", post(upload_audio))
        .route("/get-audio/:filename", get(get_audio))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(axum::middleware::from_fn(log_requests))
}

async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        target: "voxchat::gateway",
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// JSON error body: `{"error": ..., "details": ...}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let (message, details) = match err {
            PipelineError::ProfileNotFound(_) => ("Voice model not found".to_string(), None),
            PipelineError::NoReferenceSample(_) => (
                "No .wav file found in the voice model folder".to_string(),
                None,
            ),
            PipelineError::SynthesisFailed(d) => ("TTS generation failed".to_string(), Some(d)),
            PipelineError::TranscriptionFailure(d) => ("Transcription failed".to_string(), Some(d)),
            PipelineError::UnsupportedAudioFormat(d) => ("Unsupported audio format".to_string(), Some(d)),
            PipelineError::InvalidProfileName(n) => ("Invalid voice model name".to_string(), Some(n)),
            other => ("Internal server error".to_string(), Some(other.to_string())),
        };
        Self {
            status,
            message,
            details,
        }
    }
}

impl From<StageFailure> for ApiError {
    fn from(failure: StageFailure) -> Self {
        failure.error.into()
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self {
            status: err.status(),
            message: "Invalid multipart body".to_string(),
            details: Some(err.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.details {
            Some(details) => json!({ "error": self.message, "details": details }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct VoicesResponse {
    voices: Vec<String>,
}

async fn list_voices(State(state): State<AppState>) -> Result<Json<VoicesResponse>, ApiError> {
    let registry = Arc::clone(state.orchestrator.registry());
    let voices = tokio::task::spawn_blocking(move || registry.list_names())
        .await
        .map_err(PipelineError::from)?
        .map_err(PipelineError::from)?;
    Ok(Json(VoicesResponse { voices }))
}

/// POST /train-model: register `model_name` with every non-empty `voice_samples` file.
async fn train_model(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Redirect, ApiError> {
    let mut model_name: Option<String> = None;
    let mut samples = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "model_name" => model_name = Some(field.text().await?),
            "voice_samples" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let bytes = field.bytes().await?;
                // Browsers send an empty part when no file was picked.
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                samples.push(SampleUpload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let name = model_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing model_name"))?;

    let registry = Arc::clone(state.orchestrator.registry());
    let report = tokio::task::spawn_blocking(move || registry.register(&name, &samples))
        .await
        .map_err(PipelineError::from)?
        .map_err(PipelineError::from)?;
    info!(
        target: "voxchat::gateway",
        "Trained voice model '{}' ({} saved, {} skipped)",
        report.profile.name,
        report.saved.len(),
        report.skipped.len()
    );
    Ok(Redirect::to("/voices"))
}

#[derive(Serialize)]
struct UploadAudioResponse {
    response_audio: String,
    response_id: String,
    transcript: String,
    reply: String,
}

/// POST /upload-audio: run the whole pipeline for one clip.
async fn upload_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadAudioResponse>, ApiError> {
    let mut audio: Option<(String, Vec<u8>)> = None;
    let mut emotion = None;
    let mut voice_id = None;
    let mut persona = Persona::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audio" => {
                let filename = field.file_name().unwrap_or("audio.wav").to_string();
                let bytes = field.bytes().await?;
                if !bytes.is_empty() {
                    audio = Some((filename, bytes.to_vec()));
                }
            }
            "emotion" => emotion = Some(field.text().await?),
            "voice_id" => voice_id = Some(field.text().await?),
            "prompt-template" => persona = Persona::from_key(&field.text().await?),
            _ => {}
        }
    }
    let (audio_filename, audio) = audio.ok_or_else(|| ApiError::bad_request("No audio file provided"))?;

    let outcome = state
        .orchestrator
        .handle(ChatRequest {
            audio_filename,
            audio,
            emotion,
            voice_id,
            persona,
        })
        .await
        .map_err(|failure| {
            if !failure.error.is_client_error() {
                error!(target: "voxchat::gateway", "upload-audio failed: {}", failure);
            }
            ApiError::from(failure)
        })?;

    Ok(Json(UploadAudioResponse {
        response_audio: outcome.response_audio.to_string_lossy().into_owned(),
        response_id: outcome.response_id,
        transcript: outcome.transcript,
        reply: outcome.reply_text,
    }))
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

/// GET /get-audio/:filename: only plain file names inside the response directory are served.
async fn get_audio(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_filename(&filename) {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    let path = state.response_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found("Audio file not found"))
        }
        Err(e) => Err(ApiError::from(PipelineError::Io(e)).with_details(filename)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;
    use voxchat_core::{ResponseGenerator, SynthesisStage, VoiceProfileRegistry};
    use voxchat_voice::{pcm_f32_to_wav, AudioNormalizer, PlaceholderStt, PlaceholderTts};

    const BOUNDARY: &str = "voxchat-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, Vec<u8>),
    }

    fn multipart_body(parts: Vec<Part<'_>>) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, filename, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                            name, filename
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(&bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_request(uri: &str, parts: Vec<Part<'_>>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn wav() -> Vec<u8> {
        let samples: Vec<f32> = (0..4000).map(|i| (i as f32 * 0.02).sin() * 0.5).collect();
        pcm_f32_to_wav(&samples, 16_000).unwrap()
    }

    /// Placeholder STT answering "hello", no LLM key (fallback replies), placeholder TTS.
    fn test_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::rooted_at(dir.path());
        config.ensure_dirs().unwrap();
        let registry = Arc::new(
            VoiceProfileRegistry::open(&config.db_path, &config.voice_model_dir).unwrap(),
        );
        let orchestrator = ChatOrchestrator::new(
            AudioNormalizer::new(&config.upload_dir),
            Arc::new(PlaceholderStt::with_response("hello")),
            ResponseGenerator::from_config(&config.llm).unwrap(),
            registry,
            SynthesisStage::new(Arc::new(PlaceholderTts), &config.response_dir, "en"),
        );
        let app = build_app(AppState::new(orchestrator), config.max_upload_bytes);
        (dir, app)
    }

    async fn json_body(res: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn train(app: &Router, name: &str, samples: Vec<Vec<u8>>) -> Response {
        let mut parts = vec![Part::Text("model_name", name)];
        for (i, s) in samples.into_iter().enumerate() {
            let filename: &'static str = if i == 0 { "first.wav" } else { "more.wav" };
            parts.push(Part::File("voice_samples", filename, s));
        }
        app.clone()
            .oneshot(multipart_request("/train-model", parts))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (_dir, app) = test_app();
        let res = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn train_model_redirects_and_lists_voice() {
        let (_dir, app) = test_app();
        let res = train(&app, "default", vec![wav()]).await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        assert_eq!(res.headers()[header::LOCATION], "/voices");

        // Same name again: still one entry.
        let res = train(&app, "default", vec![wav()]).await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);

        let res = app
            .oneshot(Request::builder().uri("/voices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = json_body(res).await;
        assert_eq!(json["voices"], json!(["default"]));
    }

    #[tokio::test]
    async fn train_model_requires_name() {
        let (_dir, app) = test_app();
        let res = app
            .oneshot(multipart_request(
                "/train-model",
                vec![Part::File("voice_samples", "a.wav", wav())],
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "Missing model_name");
    }

    #[tokio::test]
    async fn upload_audio_round_trip() {
        let (_dir, app) = test_app();
        train(&app, "default", vec![wav()]).await;

        let res = app
            .clone()
            .oneshot(multipart_request(
                "/upload-audio",
                vec![
                    Part::File("audio", "clip.wav", wav()),
                    Part::Text("emotion", "happy"),
                    Part::Text("voice_id", "default"),
                    Part::Text("prompt-template", "friend"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = json_body(res).await;
        assert_eq!(json["transcript"], "hello");
        assert_eq!(
            json["reply"],
            format!("[happy] {}", voxchat_core::FALLBACK_REPLY)
        );
        let response_audio = json["response_audio"].as_str().unwrap().to_string();
        assert!(response_audio.ends_with(".wav"));
        let filename = std::path::Path::new(&response_audio)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        let res = app
            .oneshot(
                Request::builder()
                    .uri(format!("/get-audio/{}", filename))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "audio/wav");
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
    }

    #[tokio::test]
    async fn unknown_voice_is_bad_request() {
        let (_dir, app) = test_app();
        let res = app
            .oneshot(multipart_request(
                "/upload-audio",
                vec![
                    Part::File("audio", "clip.wav", wav()),
                    Part::Text("voice_id", "nobody"),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "Voice model not found");
    }

    #[tokio::test]
    async fn empty_voice_model_is_bad_request() {
        let (_dir, app) = test_app();
        assert_eq!(train(&app, "default", vec![]).await.status(), StatusCode::SEE_OTHER);
        let res = app
            .oneshot(multipart_request(
                "/upload-audio",
                vec![Part::File("audio", "clip.wav", wav())],
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(res).await["error"],
            "No .wav file found in the voice model folder"
        );
    }

    #[tokio::test]
    async fn upload_without_audio_is_bad_request() {
        let (_dir, app) = test_app();
        let res = app
            .oneshot(multipart_request(
                "/upload-audio",
                vec![Part::Text("emotion", "sad")],
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "No audio file provided");
    }

    #[tokio::test]
    async fn get_audio_rejects_traversal_and_missing_files() {
        let (_dir, app) = test_app();
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/get-audio/..%2Fvoice_chatbot.db")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/get-audio/missing.wav")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn filename_guard() {
        assert!(is_safe_filename("0b9c.wav"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename("../x.wav"));
        assert!(!is_safe_filename("a/b.wav"));
        assert!(!is_safe_filename("a\\b.wav"));
    }
}
