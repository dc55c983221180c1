use crate::collection::{ENTRY_IDENTITY, RawSegment, SegmentCollection};
use crate::formatter::{escape_html, format};
use crate::generator::{GenerationRequest, Generator, GeneratorConfig};
use crate::navigation::Navigator;
use crate::resolver::{Resolution, resolve_key};
use crate::segment::{Choice, Segment};
use crate::session::{
    FALLBACK_INDEX, Session, SessionError, SessionStore, generate_session_id, validate_session_id,
};
use crate::views::{DEFAULT_MAX_VIEWS, ViewKey, ViewRegistry};
use askama::Template;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use cookie::{Cookie, SameSite};
use include_dir::{Dir, include_dir};
use mime::Mime;
use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};

type SharedState = Arc<AppState>;

const VIEWER_COOKIE: &str = "adventure_viewer";
const SESSION_COOKIE: &str = "adventure_session";
const IMAGE_CACHE_CONTROL: &str = "public, max-age=31536000";
const ASSET_CACHE_CONTROL: &str = "public, max-age=3600";
const DEFAULT_GENERATE_OUTPUT: &str = "Adventure generated successfully!";
const NARRATIVE_STYLES: [&str; 5] = ["adventure", "mystery", "fantasy", "science-fiction", "horror"];

static ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/assets");
static BODY_IMAGE_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<img src=")(/[^"]*)(")"#).expect("body image pattern"));

pub struct AppState {
    pub theme: WebTheme,
    pub base_url: String,
    pub store: SessionStore,
    pub generator: Generator,
    pub views: ViewRegistry,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum WebTheme {
    #[default]
    Tailwind,
    Bootstrap,
}

impl fmt::Display for WebTheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebTheme::Tailwind => write!(f, "tailwind"),
            WebTheme::Bootstrap => write!(f, "bootstrap"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Chrome {
    use_tailwind: bool,
    use_bootstrap: bool,
    body_class: &'static str,
    main_class: &'static str,
    card_class: &'static str,
    eyebrow_class: &'static str,
    headline_class: &'static str,
    lede_class: &'static str,
    cta_group_class: &'static str,
    button_class: &'static str,
    choice_class: &'static str,
    input_class: &'static str,
}

impl Chrome {
    fn new(theme: WebTheme) -> Self {
        match theme {
            WebTheme::Tailwind => Self {
                use_tailwind: true,
                use_bootstrap: false,
                body_class: "bg-slate-50 text-slate-900",
                main_class: "min-h-screen flex flex-col items-center justify-start py-10 px-4",
                card_class: "max-w-3xl w-full space-y-6",
                eyebrow_class: "uppercase tracking-wide text-sm text-slate-500",
                headline_class: "text-4xl font-extrabold tracking-tight",
                lede_class: "text-lg text-slate-600",
                cta_group_class: "flex flex-wrap gap-3",
                button_class: "inline-flex items-center rounded-md bg-slate-900 px-4 py-2 text-white font-semibold shadow hover:bg-slate-800 transition-colors",
                choice_class: "block rounded-md border border-slate-300 bg-white px-4 py-3 font-semibold hover:bg-slate-100",
                input_class: "block w-full rounded-md border border-slate-300 px-3 py-2",
            },
            WebTheme::Bootstrap => Self {
                use_tailwind: false,
                use_bootstrap: true,
                body_class: "bg-light text-dark",
                main_class: "container py-5",
                card_class: "mx-auto col-lg-8",
                eyebrow_class: "text-uppercase text-muted mb-2",
                headline_class: "display-5 fw-bold",
                lede_class: "lead mb-4",
                cta_group_class: "d-flex flex-wrap gap-3",
                button_class: "btn btn-primary btn-lg px-4 py-2",
                choice_class: "list-group-item list-group-item-action fw-semibold",
                input_class: "form-control",
            },
        }
    }

    fn head_tags(self) -> (&'static str, &'static str) {
        if self.use_bootstrap {
            (
                r#"<link href="https://cdn.jsdelivr.net/npm/bootstrap@5.3.8/dist/css/bootstrap.min.css" rel="stylesheet" integrity="sha384-sRIl4kxILFvY47J16cr9ZwB07vP4J8+LH7qKQnuqkuIAvNWLzeN8tE5YBujZqJLB" crossorigin="anonymous">"#,
                r#"<script src="https://cdn.jsdelivr.net/npm/bootstrap@5.3.8/dist/js/bootstrap.bundle.min.js" integrity="sha384-FKyoEForCGlyvwx9Hj09JcYn3nv7wiPVlz7YYwJrWVcXK/BmnVDxM+D2scQbITxI" crossorigin="anonymous"></script>"#,
            )
        } else {
            (
                r#"<script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>"#,
                "",
            )
        }
    }
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub enable_openapi: bool,
    pub theme: WebTheme,
    pub base_url: String,
    /// Root holding one directory per story session.
    pub data_dir: PathBuf,
    pub generator: GeneratorConfig,
    pub max_upload_bytes: usize,
    pub max_views: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_openapi: true,
            theme: WebTheme::default(),
            base_url: "http://127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("data/sessions"),
            generator: GeneratorConfig::default(),
            max_upload_bytes: 50 * 1024 * 1024,
            max_views: DEFAULT_MAX_VIEWS,
        }
    }
}

#[derive(Debug)]
pub enum WebError {
    Io(std::io::Error),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for WebError {}

impl From<std::io::Error> for WebError {
    fn from(value: std::io::Error) -> Self {
        WebError::Io(value)
    }
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    // The generator runs in its own working directory, so session paths
    // handed to it must be absolute.
    let data_dir = tokio::fs::canonicalize(&config.data_dir).await?;
    let state = Arc::new(AppState {
        theme: config.theme,
        base_url: config.base_url.clone(),
        store: SessionStore::new(data_dir.clone()),
        generator: Generator::new(config.generator.clone()),
        views: ViewRegistry::new(config.max_views),
        max_upload_bytes: config.max_upload_bytes,
    });
    let router = build_router(state, config.enable_openapi);
    info!(
        %config.addr,
        theme = ?config.theme,
        openapi = config.enable_openapi,
        base = %config.base_url,
        data_dir = %data_dir.display(),
        script = %config.generator.script.display(),
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
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
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::InvalidId(_) => ApiError::bad_request("Invalid session ID"),
            SessionError::InvalidFilename(_) => ApiError::bad_request("Invalid filename"),
            SessionError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
            SessionError::Io(err) => {
                error!(error = %err, "session storage failed");
                ApiError::internal("Internal server error")
            }
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(api_generate, api_story, api_story_segments, api_resolve, api_image, health),
    components(schemas(
        GeneratePayload,
        StoryPayload,
        SegmentFilePayload,
        CollectionPayload,
        SegmentPayload,
        ChoicePayload,
        ResolvePayload
    )),
    tags((name = "stories", description = "Story generation and retrieval"))
)]
struct ApiDoc;

fn build_router(state: SharedState, openapi: bool) -> Router {
    let upload_limit = state.max_upload_bytes;
    let mut router = Router::new()
        .route("/", get(home))
        .route("/generate", post(generate_html))
        .route("/view", get(view_html))
        .route("/view/current", get(view_current))
        .route("/view/choose", get(view_choose))
        .route("/view/follow", get(view_follow))
        .route("/view/back", get(view_back))
        .route("/view/restart", get(view_restart))
        .route("/stories/:story_path", get(story_link))
        .route("/api/generate", post(api_generate))
        .route("/api/stories/:session_id", get(api_story))
        .route("/api/stories/:session_id/segments", get(api_story_segments))
        .route("/api/stories/:session_id/resolve", get(api_resolve))
        .route("/api/images/:session_id/:filename", get(api_image))
        .route("/api/redirect", get(api_redirect))
        .route("/assets/*path", get(asset))
        .route("/healthz", get(health))
        .with_state(state);
    if openapi {
        router = router.merge(api_docs_router());
    }
    router
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

#[cfg(feature = "web-openapi")]
fn api_docs_router() -> Router {
    Router::new().merge(
        utoipa_swagger_ui::SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()),
    )
}

#[cfg(not(feature = "web-openapi"))]
fn api_docs_router() -> Router {
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}

#[cfg(not(feature = "web-openapi"))]
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn home(State(state): State<SharedState>) -> impl IntoResponse {
    Html(render_home(state.theme, &state.base_url))
}

fn render_home(theme: WebTheme, base_url: &str) -> String {
    let chrome = Chrome::new(theme);
    let (css_tag, js_tag) = chrome.head_tags();
    let style_options = NARRATIVE_STYLES
        .iter()
        .map(|style| format!(r#"<option value="{style}">{style}</option>"#))
        .collect::<Vec<_>>()
        .join("\n              ");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Adventure • Turn pictures into a story</title>
    <link rel="canonical" href="{base_url}/">
    {css_tag}
    {js_tag}
  </head>
  <body class="{body_class}">
    <main class="{main_class}">
      <div class="{card_class}">
        <div>
          <p class="{eyebrow_class}">Adventure v{version}</p>
          <h1 class="{headline_class}">Turn your pictures into a choose-your-own-adventure.</h1>
          <p class="{lede_class}">Upload a few images, pick a narrative style and read the branching story generated from them.</p>
        </div>
        <form action="/generate" method="post" enctype="multipart/form-data" class="space-y-4">
          <label class="block">Images
            <input type="file" name="images" accept="image/*" multiple required class="{input_class}">
          </label>
          <label class="block">Prompt
            <textarea name="prompt" rows="3" class="{input_class}"></textarea>
          </label>
          <label class="block">Temperature
            <input type="number" name="temperature" value="0.3" min="0" max="2" step="0.1" class="{input_class}">
          </label>
          <label class="block">Narrative style
            <select name="narrativeStyle" class="{input_class}">
              {style_options}
            </select>
          </label>
          <label class="block">Story length
            <input type="number" name="storyLength" value="300" min="50" step="50" class="{input_class}">
          </label>
          <div class="{cta_group}">
            <button type="submit" class="{button_class}">Generate adventure</button>
          </div>
        </form>
        <form action="/view" method="get" class="{cta_group}">
          <input type="text" name="session" placeholder="Session id" class="{input_class}">
          <button type="submit" class="{button_class}">Open a story</button>
        </form>
      </div>
    </main>
  </body>
</html>"#,
        base_url = base_url.trim_end_matches('/'),
        css_tag = css_tag,
        js_tag = js_tag,
        body_class = chrome.body_class,
        main_class = chrome.main_class,
        card_class = chrome.card_class,
        eyebrow_class = chrome.eyebrow_class,
        headline_class = chrome.headline_class,
        lede_class = chrome.lede_class,
        input_class = chrome.input_class,
        cta_group = chrome.cta_group_class,
        button_class = chrome.button_class,
        version = env!("CARGO_PKG_VERSION"),
        style_options = style_options,
    )
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is up")),
    tag = "stories"
)]
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "adventure-web" }))
}

#[derive(Debug, Default)]
struct GenerateForm {
    images: Vec<(String, Bytes)>,
    prompt: Option<String>,
    request: GenerationRequest,
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::bad_request(format!("Malformed upload: {err}"))
}

async fn read_generate_form(mut multipart: Multipart) -> Result<GenerateForm, ApiError> {
    let mut form = GenerateForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "images" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            if !bytes.is_empty() {
                form.images.push((file_name, bytes));
            }
            continue;
        }
        let text = field.text().await.map_err(multipart_error)?;
        let value = text.trim();
        if value.is_empty() {
            continue;
        }
        match name.as_str() {
            "prompt" => form.prompt = Some(value.to_string()),
            "temperature" => {
                form.request.temperature = value
                    .parse::<f32>()
                    .ok()
                    .filter(|t| t.is_finite())
                    .ok_or_else(|| ApiError::bad_request("Invalid temperature"))?;
            }
            "storyLength" => {
                form.request.length = value
                    .parse()
                    .map_err(|_| ApiError::bad_request("Invalid story length"))?;
            }
            "narrativeStyle" => form.request.style = value.to_string(),
            _ => debug!(field = %name, "ignoring unknown upload field"),
        }
    }
    Ok(form)
}

async fn generate_story(state: &AppState, form: GenerateForm) -> Result<GeneratePayload, ApiError> {
    if form.images.is_empty() {
        return Err(ApiError::bad_request("No images provided"));
    }
    let session = state.store.create()?;
    for (position, (name, bytes)) in form.images.iter().enumerate() {
        session.save_image(position, name, bytes)?;
    }
    if let Some(prompt) = &form.prompt {
        debug!(session = %session.id(), chars = prompt.len(), "prompt received, not forwarded to the generator");
    }

    let output = state
        .generator
        .run(&session, &form.request)
        .await
        .map_err(|err| {
            error!(session = %session.id(), error = %err, "story generation failed");
            ApiError::internal("Failed to generate adventure")
        })?;

    let mut segments = session.read_segments();
    if segments.is_empty() {
        let fallback = session.write_fallback_index().unwrap_or_else(|err| {
            warn!(session = %session.id(), error = %err, "could not write fallback index");
            RawSegment::new(ENTRY_IDENTITY, FALLBACK_INDEX)
        });
        segments.push(fallback);
    }
    info!(session = %session.id(), segments = segments.len(), "story generated");

    let output = if output.stdout.trim().is_empty() {
        DEFAULT_GENERATE_OUTPUT.to_string()
    } else {
        output.stdout
    };
    Ok(GeneratePayload {
        output,
        session_id: session.id().to_string(),
        story_dir: session.output_dir().display().to_string(),
        index_content: index_content(&segments),
        story_segments: segments.into_iter().map(SegmentFilePayload::from).collect(),
    })
}

#[utoipa::path(
    post,
    path = "/api/generate",
    responses(
        (status = 200, description = "Story generated", body = GeneratePayload),
        (status = 400, description = "No images or malformed form fields"),
        (status = 500, description = "Generation script failed")
    ),
    tag = "stories"
)]
async fn api_generate(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> Result<Json<GeneratePayload>, ApiError> {
    let form = read_generate_form(multipart).await?;
    generate_story(&state, form).await.map(Json)
}

async fn generate_html(State(state): State<SharedState>, multipart: Multipart) -> Response {
    let result = match read_generate_form(multipart).await {
        Ok(form) => generate_story(&state, form).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(payload) => Redirect::to(&format!(
            "/view?session={}",
            encode_component(&payload.session_id)
        ))
        .into_response(),
        Err(err) => (err.status, Html(render_error_page(state.theme, err.message))).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/stories/{session_id}",
    params(("session_id" = String, Path, description = "Story session id")),
    responses(
        (status = 200, description = "Raw story files of the session", body = StoryPayload),
        (status = 400, description = "Malformed session id"),
        (status = 404, description = "Unknown session")
    ),
    tag = "stories"
)]
async fn api_story(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<StoryPayload>, ApiError> {
    let session = state.store.open(&session_id)?;
    let segments = session.read_segments();
    Ok(Json(StoryPayload {
        session_id: session.id().to_string(),
        story_dir: session.output_dir().display().to_string(),
        index_content: index_content(&segments),
        story_segments: segments.into_iter().map(SegmentFilePayload::from).collect(),
        image_files: session.image_files(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/stories/{session_id}/segments",
    params(("session_id" = String, Path, description = "Story session id")),
    responses(
        (status = 200, description = "Parsed segments with rendered bodies", body = CollectionPayload),
        (status = 400, description = "Malformed session id"),
        (status = 404, description = "Unknown session")
    ),
    tag = "stories"
)]
async fn api_story_segments(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<CollectionPayload>, ApiError> {
    let session = state.store.open(&session_id)?;
    let collection = load_collection(&session).await;
    Ok(Json(CollectionPayload {
        session_id: session.id().to_string(),
        title: collection.title().to_string(),
        entry: SegmentPayload::from_segment(collection.entry(), session.id()),
        segments: collection
            .others()
            .iter()
            .map(|segment| SegmentPayload::from_segment(segment, session.id()))
            .collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/stories/{session_id}/resolve",
    params(
        ("session_id" = String, Path, description = "Story session id"),
        ResolveParams
    ),
    responses(
        (status = 200, description = "Segment the link opens", body = ResolvePayload),
        (status = 400, description = "Missing target or malformed session id"),
        (status = 404, description = "Unknown session")
    ),
    tag = "stories"
)]
async fn api_resolve(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(params): Query<ResolveParams>,
) -> Result<Json<ResolvePayload>, ApiError> {
    let target = params
        .target
        .as_deref()
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .ok_or_else(|| ApiError::bad_request("Query parameter `target` is required"))?;
    let session = state.store.open(&session_id)?;
    let collection = load_collection(&session).await;
    let choice = Choice::new(params.label.unwrap_or_default(), target);
    let (key, resolution) = resolve_key(&choice, &collection);
    let segment = collection.get(key).unwrap_or_else(|| collection.entry());
    let (resolution, score) = match resolution {
        Resolution::Shortcut => ("shortcut", None),
        Resolution::Exact => ("exact", None),
        Resolution::Fuzzy { score } => ("fuzzy", Some(score)),
        Resolution::Fallback => ("fallback", None),
    };
    Ok(Json(ResolvePayload {
        source: segment.source.clone(),
        title: segment.title.clone(),
        resolution: resolution.to_string(),
        score,
    }))
}

#[utoipa::path(
    get,
    path = "/api/images/{session_id}/{filename}",
    params(
        ("session_id" = String, Path, description = "Story session id"),
        ("filename" = String, Path, description = "Uploaded image file name")
    ),
    responses(
        (status = 200, description = "Image bytes"),
        (status = 400, description = "Malformed session id or file name"),
        (status = 404, description = "Unknown session or image")
    ),
    tag = "stories"
)]
async fn api_image(
    State(state): State<SharedState>,
    Path((session_id, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let session = state.store.open(&session_id)?;
    let path = session.image_path(&filename)?;
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        error!(path = %path.display(), error = %err, "failed to read image");
        ApiError::internal("Failed to serve image")
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, image_content_type(&filename).to_string()),
            (header::CACHE_CONTROL, IMAGE_CACHE_CONTROL.to_string()),
        ],
        bytes,
    )
        .into_response())
}

async fn api_redirect(Query(params): Query<RedirectParams>) -> Redirect {
    let path = params.path.as_deref().filter(|path| !path.is_empty());
    let session = params.session.as_deref().filter(|session| !session.is_empty());
    match (path, session) {
        (Some(path), Some(session)) => Redirect::to(&format!(
            "/view?session={}&story={}",
            encode_component(session),
            encode_component(last_path_component(path))
        )),
        _ => Redirect::to("/"),
    }
}

async fn view_html(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<ViewParams>,
) -> Response {
    let session = match story_session(&state, params.session.as_deref()) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let viewer = Viewer::from_headers(&headers);
    let story = params.story.as_deref().map(last_path_component);
    let collection = load_collection(&session).await;
    let navigator = state.views.reset(viewer.key(&session), collection, |navigator| {
        navigator.open(story);
        navigator.clone()
    });
    let html = render_view(&state, session.id(), &navigator);
    viewer.respond(session.id(), Html(html))
}

async fn view_current(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
) -> Response {
    let session = match story_session(&state, params.session.as_deref()) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let viewer = Viewer::from_headers(&headers);
    let navigator = update_view(&state, viewer.key(&session), &session, |_| {}).await;
    let html = render_view(&state, session.id(), &navigator);
    viewer.respond(session.id(), Html(html))
}

async fn view_choose(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<ChooseParams>,
) -> Response {
    navigate(&state, &headers, params.session.as_deref(), |navigator| {
        if let Some(index) = params.choice {
            navigator.select_index(index);
        }
    })
    .await
}

async fn view_follow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<FollowParams>,
) -> Response {
    navigate(&state, &headers, params.session.as_deref(), |navigator| {
        if let Some(target) = params.target.as_deref() {
            let label = params.label.as_deref().unwrap_or_default();
            navigator.select(&Choice::new(label, target));
        }
    })
    .await
}

async fn view_back(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
) -> Response {
    navigate(&state, &headers, params.session.as_deref(), |navigator| {
        navigator.back();
    })
    .await
}

async fn view_restart(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<SessionParams>,
) -> Response {
    navigate(&state, &headers, params.session.as_deref(), |navigator| {
        navigator.restart();
    })
    .await
}

/// Plain story links land here when the click was not intercepted; the
/// session comes from the cookie set by the last rendered view.
async fn story_link(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(story_path): Path<String>,
) -> Response {
    let Some(session_id) = read_cookie(&headers, SESSION_COOKIE) else {
        return Redirect::to("/").into_response();
    };
    let target = format!("/stories/{story_path}");
    navigate(&state, &headers, Some(&session_id), |navigator| {
        navigator.select(&Choice::new("", target));
    })
    .await
}

async fn asset(Path(path): Path<String>) -> Response {
    match ASSETS.get_file(&path) {
        Some(file) => (
            [
                (header::CONTENT_TYPE, asset_content_type(&path).to_string()),
                (header::CACHE_CONTROL, ASSET_CACHE_CONTROL.to_string()),
            ],
            file.contents(),
        )
            .into_response(),
        None => ApiError::not_found(format!("asset {path} not found")).into_response(),
    }
}

/// Applies `action` to the reader's view and redirects to the current page.
async fn navigate(
    state: &AppState,
    headers: &HeaderMap,
    session_id: Option<&str>,
    action: impl FnOnce(&mut Navigator),
) -> Response {
    let session = match story_session(state, session_id) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let viewer = Viewer::from_headers(headers);
    update_view(state, viewer.key(&session), &session, action).await;
    let location = format!("/view/current?session={}", encode_component(session.id()));
    viewer.respond(session.id(), Redirect::to(&location))
}

/// Applies `action` to the reader's view and returns a snapshot of it for
/// rendering. A cold view is read from disk before the registry is touched.
async fn update_view(
    state: &AppState,
    key: ViewKey,
    session: &Session,
    action: impl FnOnce(&mut Navigator),
) -> Navigator {
    let preloaded = if state.views.contains(&key) {
        None
    } else {
        Some(load_collection(session).await)
    };
    // An eviction between `contains` and here falls back to a direct read.
    state.views.with_view(
        key,
        || preloaded.unwrap_or_else(|| session.load_collection()),
        |navigator| {
            action(navigator);
            navigator.clone()
        },
    )
}

async fn load_collection(session: &Session) -> SegmentCollection {
    let session = session.clone();
    let id = session.id().to_string();
    tokio::task::spawn_blocking(move || session.load_collection())
        .await
        .unwrap_or_else(|err| {
            error!(session = %id, error = %err, "loading story segments failed");
            SegmentCollection::failed("Failed to load story")
        })
}

fn story_session(state: &AppState, session_id: Option<&str>) -> Result<Session, Response> {
    let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
        return Err(no_story_response(state.theme, StatusCode::NOT_FOUND));
    };
    state.store.open(session_id).map_err(|err| {
        let status = match err {
            SessionError::InvalidId(_) | SessionError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Io(ref io) => {
                error!(session = %session_id, error = %io, "failed to open session");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        no_story_response(state.theme, status)
    })
}

fn no_story_response(theme: WebTheme, status: StatusCode) -> Response {
    let html = render_notice_page(
        theme,
        "No story data available",
        "No story data available. Generate a story first.",
    );
    (status, Html(html)).into_response()
}

/// The browser reading a story, identified by a long-lived cookie.
struct Viewer {
    id: String,
    fresh: bool,
}

impl Viewer {
    fn from_headers(headers: &HeaderMap) -> Self {
        match read_cookie(headers, VIEWER_COOKIE).filter(|id| validate_session_id(id).is_ok()) {
            Some(id) => Self { id, fresh: false },
            None => Self {
                id: generate_session_id(),
                fresh: true,
            },
        }
    }

    fn key(&self, session: &Session) -> ViewKey {
        ViewKey::new(self.id.clone(), session.id())
    }

    fn respond(&self, session_id: &str, body: impl IntoResponse) -> Response {
        let mut headers = HeaderMap::new();
        if self.fresh {
            if let Some(value) = cookie_header(VIEWER_COOKIE, self.id.clone()) {
                headers.append(header::SET_COOKIE, value);
            }
        }
        if let Some(value) = cookie_header(SESSION_COOKIE, session_id.to_string()) {
            headers.append(header::SET_COOKIE, value);
        }
        (headers, body).into_response()
    }
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value))
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

fn cookie_header(name: &'static str, value: String) -> Option<HeaderValue> {
    let cookie = Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();
    HeaderValue::from_str(&cookie.to_string()).ok()
}

#[derive(Debug, Deserialize)]
struct ViewParams {
    session: Option<String>,
    story: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChooseParams {
    session: Option<String>,
    choice: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FollowParams {
    session: Option<String>,
    target: Option<String>,
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    path: Option<String>,
    session: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ResolveParams {
    /// Link target, e.g. `/stories/forest`.
    target: Option<String>,
    /// Visible link text.
    label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct SegmentFilePayload {
    filename: String,
    content: String,
}

impl From<RawSegment> for SegmentFilePayload {
    fn from(value: RawSegment) -> Self {
        Self {
            filename: value.identity,
            content: value.content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct GeneratePayload {
    /// Standard output of the generation script.
    output: String,
    session_id: String,
    story_dir: String,
    index_content: String,
    story_segments: Vec<SegmentFilePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct StoryPayload {
    session_id: String,
    story_dir: String,
    index_content: String,
    story_segments: Vec<SegmentFilePayload>,
    image_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ChoicePayload {
    label: String,
    target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct SegmentPayload {
    source: String,
    title: String,
    body: String,
    /// Body rendered to HTML with image paths pointing at the image route.
    html: String,
    image: Option<String>,
    choices: Vec<ChoicePayload>,
}

impl SegmentPayload {
    fn from_segment(segment: &Segment, session_id: &str) -> Self {
        Self {
            source: segment.source.clone(),
            title: segment.title.clone(),
            body: segment.body.clone(),
            html: rewrite_body_images(&format(&segment.body), session_id),
            image: segment
                .image
                .as_deref()
                .map(|path| session_image_url(session_id, path)),
            choices: segment
                .choices
                .iter()
                .map(|choice| ChoicePayload {
                    label: choice.label.clone(),
                    target: choice.target.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CollectionPayload {
    session_id: String,
    title: String,
    entry: SegmentPayload,
    segments: Vec<SegmentPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ResolvePayload {
    source: String,
    title: String,
    /// One of `shortcut`, `exact`, `fuzzy` or `fallback`.
    resolution: String,
    score: Option<u32>,
}

fn index_content(segments: &[RawSegment]) -> String {
    segments
        .iter()
        .find(|segment| segment.identity == ENTRY_IDENTITY)
        .map(|segment| segment.content.clone())
        .unwrap_or_default()
}

fn last_path_component(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Absolute image paths written by the generator point at the upload
/// directory; they are served per session from the image route.
fn session_image_url(session_id: &str, path: &str) -> String {
    if !path.starts_with('/') {
        return path.to_string();
    }
    format!(
        "/api/images/{}/{}",
        encode_component(session_id),
        encode_component(last_path_component(path))
    )
}

fn rewrite_body_images(html: &str, session_id: &str) -> String {
    BODY_IMAGE_SRC
        .replace_all(html, |caps: &Captures<'_>| {
            format!(
                "{}{}{}",
                &caps[1],
                session_image_url(session_id, &caps[2]),
                &caps[3]
            )
        })
        .into_owned()
}

fn image_content_type(filename: &str) -> Mime {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => mime::IMAGE_PNG,
        Some("gif") => mime::IMAGE_GIF,
        Some("webp") => "image/webp".parse().unwrap_or(mime::APPLICATION_OCTET_STREAM),
        _ => mime::IMAGE_JPEG,
    }
}

fn asset_content_type(path: &str) -> Mime {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("js") => mime::APPLICATION_JAVASCRIPT_UTF_8,
        Some("css") => mime::TEXT_CSS_UTF_8,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

struct ChoiceLink {
    label: String,
    href: String,
}

fn render_view(state: &AppState, session_id: &str, navigator: &Navigator) -> String {
    let Some(segment) = navigator.current() else {
        return render_notice_page(
            state.theme,
            "No story data available",
            "No story data available. Generate a story first.",
        );
    };
    let encoded_session = encode_component(session_id);
    let story_title = navigator
        .collection()
        .map(|collection| collection.title().to_string())
        .unwrap_or_default();
    let template = ViewTemplate {
        chrome: Chrome::new(state.theme),
        canonical_url: match navigator.current_path() {
            Some(path) => format!(
                "{}/view?session={encoded_session}&story={}",
                state.base_url.trim_end_matches('/'),
                encode_component(&path)
            ),
            None => format!(
                "{}/view?session={encoded_session}",
                state.base_url.trim_end_matches('/')
            ),
        },
        story_title,
        session_id: session_id.to_string(),
        title: segment.title.clone(),
        image_url: segment
            .image
            .as_deref()
            .map(|path| session_image_url(session_id, path)),
        body_html: rewrite_body_images(&format(&segment.body), session_id),
        choices: segment
            .choices
            .iter()
            .enumerate()
            .map(|(index, choice)| ChoiceLink {
                label: choice.label.clone(),
                href: format!("/view/choose?session={encoded_session}&choice={index}"),
            })
            .collect(),
        trail: navigator.history().map(|s| s.title.clone()).collect(),
        can_go_back: navigator.can_go_back(),
        back_href: format!("/view/back?session={encoded_session}"),
        restart_href: format!("/view/restart?session={encoded_session}"),
    };
    template
        .render()
        .unwrap_or_else(|err| render_error_page(state.theme, err.to_string()))
}

fn render_error_page(theme: WebTheme, message: impl Into<String>) -> String {
    render_notice_page(theme, "Something went wrong", &message.into())
}

fn render_notice_page(theme: WebTheme, heading: &str, message: &str) -> String {
    let chrome = Chrome::new(theme);
    let (css_tag, js_tag) = chrome.head_tags();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Adventure • {heading}</title>
    {css_tag}
    {js_tag}
  </head>
  <body class="{body_class}">
    <main class="{main_class}">
      <div class="{card_class}">
        <h1 class="{headline_class}">{heading}</h1>
        <p class="{lede_class}">{message}</p>
        <a href="/" class="{button_class}">Back to home</a>
      </div>
    </main>
  </body>
</html>"#,
        css_tag = css_tag,
        js_tag = js_tag,
        body_class = chrome.body_class,
        main_class = chrome.main_class,
        card_class = chrome.card_class,
        headline_class = chrome.headline_class,
        lede_class = chrome.lede_class,
        button_class = chrome.button_class,
        heading = escape_html(heading),
        message = escape_html(message),
    )
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{{ story_title }} • {{ title }}</title>
    {% if chrome.use_tailwind %}
    <script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
    {% endif %}
    {% if chrome.use_bootstrap %}
    <link href="https://cdn.jsdelivr.net/npm/bootstrap@5.3.8/dist/css/bootstrap.min.css" rel="stylesheet" integrity="sha384-sRIl4kxILFvY47J16cr9ZwB07vP4J8+LH7qKQnuqkuIAvNWLzeN8tE5YBujZqJLB" crossorigin="anonymous">
    <script src="https://cdn.jsdelivr.net/npm/bootstrap@5.3.8/dist/js/bootstrap.bundle.min.js" integrity="sha384-FKyoEForCGlyvwx9Hj09JcYn3nv7wiPVlz7YYwJrWVcXK/BmnVDxM+D2scQbITxI" crossorigin="anonymous"></script>
    {% endif %}
    <link rel="canonical" href="{{ canonical_url }}">
    <script src="/assets/story.js" defer></script>
  </head>
  <body class="{{ chrome.body_class }}">
    <main class="{{ chrome.main_class }}">
      <article id="story" class="{{ chrome.card_class }}" data-session="{{ session_id }}">
        <div>
          <p class="{{ chrome.eyebrow_class }}">{{ story_title }}</p>
          <h1 class="{{ chrome.headline_class }}">{{ title }}</h1>
          {% if trail.len() > 1 %}
          <nav aria-label="Story path" class="text-sm text-slate-500">
            {% for step in trail %}{% if !loop.first %} › {% endif %}<span>{{ step }}</span>{% endfor %}
          </nav>
          {% endif %}
        </div>

        {% if let Some(url) = image_url %}
        <img src="{{ url }}" alt="{{ title }}" class="rounded-lg shadow max-w-full h-auto img-fluid">
        {% endif %}

        <section class="{{ chrome.lede_class }}">{{ body_html|safe }}</section>

        {% if choices.len() > 0 %}
        <section>
          <h2 class="text-xl font-semibold mb-2">What do you do?</h2>
          <ul class="space-y-2 list-none list-group">
            {% for choice in choices %}
            <li><a href="{{ choice.href }}" class="{{ chrome.choice_class }}">{{ choice.label }}</a></li>
            {% endfor %}
          </ul>
        </section>
        {% else %}
        <p class="{{ chrome.lede_class }}">The End.</p>
        {% endif %}

        <div class="{{ chrome.cta_group_class }}">
          {% if can_go_back %}
          <a href="{{ back_href }}" class="{{ chrome.button_class }}">Back</a>
          {% endif %}
          <a href="{{ restart_href }}" class="{{ chrome.button_class }}">Restart</a>
          <a href="/" class="{{ chrome.button_class }}">New story</a>
        </div>
      </article>
    </main>
  </body>
</html>"#,
    ext = "html"
)]
struct ViewTemplate {
    chrome: Chrome,
    canonical_url: String,
    story_title: String,
    session_id: String,
    title: String,
    image_url: Option<String>,
    body_html: String,
    choices: Vec<ChoiceLink>,
    trail: Vec<String>,
    can_go_back: bool,
    back_href: String,
    restart_href: String,
}
