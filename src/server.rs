use std::{
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use archiver::parse::TIMESTAMP_FORMAT;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use completion::{Completion, CompletionError};
use regex::Regex;
use render::{
    encode_png, AnimationFormat, TileError, TileRequest, TileSnapshot, TileWindow, Timelapse,
};
use serde::{Deserialize, Serialize};
use structures::Dataset;
use tracing::{debug, info, warn};

use crate::config::ServerSettings;

static TILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_(\d+)_z(\d+)_(\d+)x(\d+)\.png$").expect("tile path pattern is valid")
});

/// Everything the handlers serve, each piece computed at most once.
pub struct AppState {
    dataset: Completion<Arc<Dataset>>,
    tiles: Completion<Arc<TileSnapshot>>,
    gif: Completion<Bytes>,
    apng: Completion<Bytes>,
    settings: ServerSettings,
}

impl AppState {
    /// Must be called from within a tokio runtime. The tile snapshot starts
    /// as soon as the dataset is ready; timelapses wait for their first request.
    pub fn new(dataset: Completion<Arc<Dataset>>, settings: ServerSettings) -> Self {
        Self::with_frame_renderer(dataset, settings, Timelapse::render)
    }

    /// Like [`AppState::new`], with timelapse frames produced by `render`.
    /// Both animation formats share the single call to it.
    pub fn with_frame_renderer<F>(
        dataset: Completion<Arc<Dataset>>,
        settings: ServerSettings,
        render: F,
    ) -> Self
    where
        F: FnOnce(&Dataset, Duration) -> Timelapse + Send + 'static,
    {
        let tiles = dataset.derive(|dataset| Ok(Arc::new(TileSnapshot::build(&dataset))));

        let bucket = settings.timelapse_bucket;
        let frames = dataset.derive_lazy(move |dataset| {
            info!(bucket_secs = bucket.as_secs(), "Rendering timelapse frames");
            Ok(Arc::new(render(&dataset, bucket)))
        });

        Self {
            gif: encoded(&frames, AnimationFormat::Gif),
            apng: encoded(&frames, AnimationFormat::Apng),
            dataset,
            tiles,
            settings,
        }
    }

    fn animation(&self, format: AnimationFormat) -> &Completion<Bytes> {
        match format {
            AnimationFormat::Gif => &self.gif,
            AnimationFormat::Apng => &self.apng,
        }
    }
}

fn encoded(frames: &Completion<Arc<Timelapse>>, format: AnimationFormat) -> Completion<Bytes> {
    frames.derive_lazy(move |timelapse| Ok(Bytes::from(timelapse.encode(format)?)))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/tiles/:name", get(tile_handler))
        .route("/render/:name", get(animation_handler))
        .route("/pixel", get(pixel_handler))
        .fallback(|| async { ApiError::NotFound })
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotReady(CompletionError),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Failed(String),
}

impl From<CompletionError> for ApiError {
    fn from(err: CompletionError) -> Self {
        if err.is_not_ready() {
            ApiError::NotReady(err)
        } else {
            // The dataset failed or its loader died
            ApiError::Failed(err.to_string())
        }
    }
}

impl From<TileError> for ApiError {
    fn from(err: TileError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Failed(message) => {
                warn!(error = %message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// GET /status
async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.dataset.wait_timeout(state.settings.status_timeout).await {
        Ok(_) => "OK".into_response(),
        // A failed dataset is reported the same way as a slow one
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

fn parse_tile_name(name: &str) -> Result<TileRequest, ApiError> {
    let captures = TILE_PATH.captures(name).ok_or(ApiError::NotFound)?;
    let number = |group: usize| -> Result<u32, ApiError> {
        let text = &captures[group];
        text.parse()
            .map_err(|err| ApiError::BadRequest(format!("{text:?}: {err}")))
    };

    let request = TileRequest {
        x: number(1)?,
        y: number(2)?,
        zoom: number(3)?,
        width: number(4)?,
        height: number(5)?,
    };
    request.validate()?;
    Ok(request)
}

/// GET /tiles/{x}_{y}_z{zoom}_{width}x{height}.png
async fn tile_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let request = parse_tile_name(&name)?;
    let snapshot = state.tiles.wait_timeout(state.settings.request_timeout).await?;
    debug!(?request, "Serving tile");

    let png =
        tokio::task::spawn_blocking(move || encode_png(&TileWindow::new(&snapshot, request)))
            .await
            .map_err(|err| ApiError::Failed(format!("tile encoder did not finish: {err}")))?
            .map_err(|err| ApiError::Failed(err.to_string()))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// GET /render/timelapse.{gif,apng}
async fn animation_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let format = name
        .strip_prefix("timelapse.")
        .and_then(AnimationFormat::from_extension)
        .ok_or(ApiError::NotFound)?;

    let started = Instant::now();
    let data = state
        .animation(format)
        .wait_timeout(state.settings.request_timeout)
        .await?;
    debug!(
        content_type = format.content_type(),
        bytes = data.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Serving timelapse"
    );

    Ok(([(header::CONTENT_TYPE, format.content_type())], data).into_response())
}

#[derive(Debug, Deserialize)]
struct PixelQuery {
    x: u32,
    y: u32,
}

#[derive(Debug, Serialize)]
struct PixelEventJson {
    timestamp: String,
    x: u32,
    y: u32,
    user_id: String,
    color: String,
}

/// GET /pixel?x=&y=
async fn pixel_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PixelQuery>,
) -> Result<Json<Vec<PixelEventJson>>, ApiError> {
    let dataset = state
        .dataset
        .wait_timeout(state.settings.request_timeout)
        .await?;
    let events = dataset
        .events_at(query.x, query.y)
        .ok_or(ApiError::NotFound)?;

    let history = events
        .iter()
        .map(|event| {
            let [r, g, b, _] = dataset.color(event.color_index).unwrap_or_default();
            PixelEventJson {
                timestamp: dataset
                    .time_of(event.delta_millis)
                    .format(TIMESTAMP_FORMAT)
                    .to_string(),
                x: query.x,
                y: query.y,
                user_id: dataset
                    .user_ids
                    .get(event.user_index as usize)
                    .cloned()
                    .unwrap_or_default(),
                color: format!("#{r:02X}{g:02X}{b:02X}"),
            }
        })
        .collect();
    Ok(Json(history))
}
