use std::net::TcpListener;
use std::sync::Arc;

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, dev::Server, get, post, web};
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde_json::json;
use tracing::info;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::io_struct::RequestEnvelope;
use crate::output::WireRecord;
use crate::worker::WorkerHandler;

/// Generation requests may carry inline base64 media.
const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<dyn WorkerHandler>,
    pub model: String,
}

impl AppState {
    pub fn new(handler: Arc<dyn WorkerHandler>, model: impl Into<String>) -> Self {
        AppState {
            handler,
            model: model.into(),
        }
    }
}

#[get("/health")]
pub async fn health(_req: HttpRequest, _: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[get("/get_model_info")]
pub async fn get_model_info(_req: HttpRequest, app_state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "model_path": app_state.model,
        "worker_type": app_state.handler.worker_type(),
    }))
}

/// Streams one newline-delimited record per output. A failure before the
/// first output is reported as an HTTP error; later failures arrive as a
/// final error record.
#[post("/generate")]
pub async fn generate(
    _req: HttpRequest,
    body: Bytes,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, WorkerError> {
    let text = String::from_utf8(body.to_vec())
        .map_err(|e| WorkerError::malformed("<root>", format!("request body is not UTF-8: {}", e)))?;

    let mut outputs = app_state.handler.generate(RequestEnvelope::Text(text));
    let first = match outputs.next().await {
        Some(Err(err)) => return Err(err),
        first => first,
    };

    let lines = stream::iter(first)
        .chain(outputs)
        .map(|item| WireRecord::from(&item).to_line());

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(lines))
}

#[post("/clear_kv_blocks")]
pub async fn clear_kv_blocks(_req: HttpRequest, app_state: web::Data<AppState>) -> HttpResponse {
    let status = app_state.handler.clear_kv_blocks().await;
    HttpResponse::Ok().json(status)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(get_model_info)
        .service(generate)
        .service(clear_kv_blocks);
}

pub fn build_server(app_state: AppState, listener: TcpListener) -> std::io::Result<Server> {
    let app_state = web::Data::new(app_state);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(app_state.clone())
            .app_data(web::PayloadConfig::new(MAX_PAYLOAD_SIZE))
            .configure(configure)
    })
    .listen(listener)?
    .run();
    Ok(server)
}

pub async fn startup(config: WorkerConfig, handler: Arc<dyn WorkerHandler>) -> std::io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    info!(
        "Starting {} worker for {} at {}:{}",
        handler.worker_type(),
        config.model,
        config.host,
        config.port
    );
    build_server(AppState::new(handler, config.model), listener)?.await
}
