//! Page Server
//!
//! Serves the single upload page over HTTP. Every request is handled on its
//! own. Decoding, recognition and result encoding run on a blocking worker;
//! the shared recognizer is locked during recognition, so uploads are
//! recognized one at a time.

pub mod error;
pub mod page;
pub mod upload;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::{self, DispatchSettings, Mode, PageRequest, PageView};
use crate::config::ServerConfig;
use crate::vision::Recognizer;
pub use error::WebError;
use page::EncodedImage;
use upload::UploadForm;

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub recognizer: Arc<Mutex<Box<dyn Recognizer>>>,
    pub settings: Arc<DispatchSettings>,
}

impl AppState {
    pub fn new(recognizer: Box<dyn Recognizer>, settings: DispatchSettings) -> Self {
        Self {
            recognizer: Arc::new(Mutex::new(recognizer)),
            settings: Arc::new(settings),
        }
    }
}

/// Build the page router
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let address = config.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    info!("Serving on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state, config.max_upload_bytes)).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    mode: Option<String>,
}

async fn index(Query(query): Query<PageQuery>) -> Response {
    let mode = match query.mode {
        None => Mode::default(),
        Some(value) => match value.parse() {
            Ok(mode) => mode,
            Err(_) => return error_page(Mode::default(), WebError::UnknownMode(value)),
        },
    };

    Html(page::render_page(&PageView::empty(mode), &[], None)).into_response()
}

async fn submit(State(state): State<AppState>, multipart: Multipart) -> Response {
    let form = match upload::read_form(multipart).await {
        Ok(form) => form,
        Err(e) => return error_page(Mode::default(), e),
    };

    let mode = form.mode;
    match process(&state, form).await {
        Ok((view, images)) => Html(page::render_page(&view, &images, None)).into_response(),
        Err(e) => error_page(mode, e),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Run [`prepare_page`] on a blocking worker
async fn process(state: &AppState, form: UploadForm) -> Result<(PageView, Vec<EncodedImage>), WebError> {
    let recognizer = Arc::clone(&state.recognizer);
    let settings = Arc::clone(&state.settings);
    let start = Instant::now();

    let (view, images) =
        tokio::task::spawn_blocking(move || prepare_page(form, &recognizer, &settings)).await??;

    debug!("Handled {:?} request in {:?}", view.mode, start.elapsed());
    Ok((view, images))
}

/// Decode, dispatch and encode one submission
///
/// Blocks for the whole image codec and inference time; never call it on
/// the async runtime thread.
fn prepare_page(
    form: UploadForm,
    recognizer: &Mutex<Box<dyn Recognizer>>,
    settings: &DispatchSettings,
) -> Result<(PageView, Vec<EncodedImage>), WebError> {
    let upload = form.file.map(upload::decode_upload).transpose()?;
    let request = PageRequest {
        mode: form.mode,
        upload,
    };

    let view = {
        let mut recognizer = recognizer.lock();
        app::handle_request(request, &mut **recognizer, settings).map_err(WebError::Recognition)?
    };

    let images = page::encode_images(&view)?;
    Ok((view, images))
}

fn error_page(mode: Mode, err: WebError) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }

    let html = page::render_page(&PageView::empty(mode), &[], Some(&err.to_string()));
    (status, Html(html)).into_response()
}
