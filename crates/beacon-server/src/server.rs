//! HTTP surface of the collector: route registration, CORS, TLS bootstrap,
//! identity headers and the shared error envelope. The ingestion semantics
//! live in `beacon-core`; everything here is the thin wrapper around warp.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::signal;
use tracing::{debug, error, info};
use warp::filters::BoxedFilter;
use warp::http::{HeaderValue, Response, StatusCode};
use warp::{Filter, Reply};

use beacon_core::{ingest, resolve_transport, BeaconError, LogReader, TraceStore, Transport};

use crate::config::Config;
use crate::metrics;
use crate::pixel::PIXEL_JPEG;

pub const SERVER_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"));

/// Header names carried on every response, success or failure.
pub const CALLER_IP_HEADER: &str = "x-caller-ip";
pub const SERVER_VERSION_HEADER: &str = "x-server-version";

/// Shared per-process context handed to every handler. Constructed once at
/// startup; there is no ambient singleton behind it.
#[derive(Clone)]
pub struct AppContext {
    pub transport: Arc<dyn Transport>,
    pub reader: LogReader,
}

pub async fn build_context(config: &Config) -> Result<AppContext, anyhow::Error> {
    let store = TraceStore::open(
        config.sink.path.clone(),
        config.sink.queue_capacity,
        Duration::from_millis(config.sink.enqueue_timeout_ms),
    )
    .await?;
    let transport = resolve_transport(&config.sink.kind, &store)?;
    Ok(AppContext {
        transport,
        reader: LogReader::new(store),
    })
}

pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    // Start Metrics
    if config.metrics.enabled {
        let conf = config.metrics.clone();
        tokio::spawn(async move {
            metrics::start_metrics_server(conf.host, conf.port).await;
        });
    }

    let ctx = build_context(&config).await?;
    let api = routes(ctx, &config.cors.allowed_origins);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    println!("{} listening on {}", SERVER_VERSION, addr);
    println!("  - Sink: {}", config.sink.kind);

    match &config.tls {
        Some(tls) => {
            if tls.passphrase_path.is_some() {
                return Err(BeaconError::Configuration(
                    "passphrase-protected TLS keys are not supported; provide a cleartext PEM key"
                        .to_string(),
                )
                .into());
            }
            println!("  - TLS: enabled");
            let server = warp::serve(api)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .run(addr);
            tokio::select! {
                _ = server => {}
                _ = signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
        None => {
            let server = warp::serve(api).run(addr);
            tokio::select! {
                _ = server => {}
                _ = signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
    }

    Ok(())
}

/// Assemble the route set. Split out of `run` so tests can drive it through
/// `warp::test` without binding a socket.
pub fn routes(ctx: AppContext, cors_allowed: &[String]) -> BoxedFilter<(warp::reply::Response,)> {
    let with_ctx = warp::any().map(move || ctx.clone());

    let index = warp::get()
        .and(warp::path::end())
        .and(with_ctx.clone())
        .and_then(handle_index);

    let info = warp::get()
        .and(warp::path("info"))
        .and(warp::path::end())
        .and_then(handle_info);

    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .map(|| "OK");

    let logs = warp::get()
        .and(warp::path("logs.json"))
        .and(warp::path::end())
        .and(with_ctx.clone())
        .and_then(handle_logs);

    let log_by_id = warp::get()
        .and(warp::path("logs"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_ctx.clone())
        .and_then(handle_log_by_id);

    let pixel = warp::get()
        .and(warp::path("tracer.jpg"))
        .and(warp::path::end())
        .and(warp::query::raw())
        .and(client_origin())
        .and(with_ctx.clone())
        .and_then(handle_pixel);

    // Path before method: a GET to an unknown path should combine into a
    // plain 404, not this route's method rejection.
    let trace = warp::path("trace")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::json())
        .and(client_origin())
        .and(with_ctx)
        .and_then(handle_trace);

    let cors = if cors_allowed.is_empty() {
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST", "OPTIONS"])
            .allow_headers(vec!["content-type"])
            .build()
    } else {
        warp::cors()
            .allow_origins(cors_allowed.iter().map(|s| s.as_str()))
            .allow_methods(vec!["GET", "POST", "OPTIONS"])
            .allow_headers(vec!["content-type"])
            .build()
    };

    let api = index
        .or(info)
        .or(health)
        .or(logs)
        .or(log_by_id)
        .or(pixel)
        .or(trace)
        .with(cors)
        .recover(handle_rejection);

    // Identity headers ride on every response, rejections included.
    client_origin()
        .and(api)
        .map(|origin: String, reply| {
            let mut resp = Reply::into_response(reply);
            if let Ok(value) = HeaderValue::from_str(&origin) {
                resp.headers_mut().insert(CALLER_IP_HEADER, value);
            }
            resp.headers_mut()
                .insert(SERVER_VERSION_HEADER, HeaderValue::from_static(SERVER_VERSION));
            resp
        })
        .boxed()
}

/// Derive the client origin: forwarded-for header first, raw connection
/// address second. Downstream, this is the only source for `host`.
fn client_origin() -> impl Filter<Extract = (String,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("x-forwarded-for")
        .and(warp::addr::remote())
        .map(|forwarded: Option<String>, remote: Option<SocketAddr>| {
            forwarded
                .as_deref()
                .and_then(|list| list.split(',').next())
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .or_else(|| remote.map(|addr| addr.ip().to_string()))
                .unwrap_or_else(|| "unknown".to_string())
        })
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_index(ctx: AppContext) -> Result<warp::reply::Response, Infallible> {
    metrics::READ_QUERIES_TOTAL.inc();
    let records = ctx.reader.list().await.unwrap_or_else(|e| {
        error!("Index listing degraded to empty: {}", e);
        Vec::new()
    });

    let mut rows = String::new();
    for record in &records {
        rows.push_str(&format!(
            "<li><a href=\"/logs/{id}.json\">{id}</a> &mdash; {host} @ {ts}</li>\n",
            id = escape_html(&record.id),
            host = escape_html(&record.host),
            ts = escape_html(&record.timestamp),
        ));
    }
    let page = format!(
        "<!DOCTYPE html>\n<html><head><title>beacon</title></head>\
         <body><h1>Collected traces ({count})</h1><ul>\n{rows}</ul></body></html>",
        count = records.len(),
        rows = rows,
    );
    Ok(warp::reply::html(page).into_response())
}

async fn handle_info() -> Result<warp::reply::Response, Infallible> {
    Ok(SERVER_VERSION.into_response())
}

async fn handle_logs(ctx: AppContext) -> Result<warp::reply::Response, Infallible> {
    metrics::READ_QUERIES_TOTAL.inc();
    match ctx.reader.list_json().await {
        Ok(listing) => Ok(warp::reply::json(&listing).into_response()),
        Err(e) => Ok(reply_error(&e)),
    }
}

async fn handle_log_by_id(
    segment: String,
    ctx: AppContext,
) -> Result<warp::reply::Response, Infallible> {
    metrics::READ_QUERIES_TOTAL.inc();
    let id = segment
        .strip_suffix(".json")
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let id = match id {
        Some(id) => id,
        None => return Ok(reply_error(&BeaconError::NotFound(segment))),
    };

    match ctx.reader.fetch(&id).await {
        Ok(record) => Ok(warp::reply::json(&record).into_response()),
        Err(e) => Ok(reply_error(&e)),
    }
}

async fn handle_pixel(
    query: String,
    origin: String,
    ctx: AppContext,
) -> Result<warp::reply::Response, Infallible> {
    let decoded = match percent_encoding::percent_decode_str(&query).decode_utf8() {
        Ok(s) => s.into_owned(),
        Err(e) => {
            metrics::INGEST_ERRORS_TOTAL.inc();
            return Ok(reply_error(&BeaconError::Validation(format!(
                "query string is not valid UTF-8: {}",
                e
            ))));
        }
    };
    let payload: Value = match serde_json::from_str(&decoded) {
        Ok(v) => v,
        Err(e) => {
            metrics::INGEST_ERRORS_TOTAL.inc();
            return Ok(reply_error(&BeaconError::Validation(format!(
                "query string is not a JSON object: {}",
                e
            ))));
        }
    };

    match ingest(payload, &origin, ctx.transport.as_ref()).await {
        Ok(record) => {
            metrics::TRACES_INGESTED_TOTAL.inc();
            debug!(id = %record.id, "pixel beacon accepted");
            match Response::builder()
                .header("content-type", "image/jpeg")
                .body(warp::hyper::Body::from(PIXEL_JPEG))
            {
                Ok(resp) => Ok(resp),
                Err(e) => Ok(reply_error(&BeaconError::StoreUnavailable(e.to_string()))),
            }
        }
        Err(e) => {
            metrics::INGEST_ERRORS_TOTAL.inc();
            Ok(reply_error(&e))
        }
    }
}

async fn handle_trace(
    payload: Value,
    origin: String,
    ctx: AppContext,
) -> Result<warp::reply::Response, Infallible> {
    match ingest(payload, &origin, ctx.transport.as_ref()).await {
        Ok(record) => {
            metrics::TRACES_INGESTED_TOTAL.inc();
            debug!(id = %record.id, host = %record.host, "trace accepted");
            let body = json!({
                "timestamp": record.timestamp,
                "error": null,
                "id": record.id,
                "httpStatus": 200,
            });
            Ok(warp::reply::json(&body).into_response())
        }
        Err(e) => {
            metrics::INGEST_ERRORS_TOTAL.inc();
            Ok(reply_error(&e))
        }
    }
}

// ============================================================================
// Shared error path
// ============================================================================

fn status_for(err: &BeaconError) -> StatusCode {
    match err {
        BeaconError::NotFound(_) => StatusCode::NOT_FOUND,
        BeaconError::Configuration(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render a domain error as the uniform envelope and log it. A missing id is
/// a user-facing condition, not a server fault.
fn reply_error(err: &BeaconError) -> warp::reply::Response {
    match err {
        BeaconError::NotFound(_) => info!("{}", err),
        _ => error!("{}", err),
    }
    error_envelope(status_for(err), &err.to_string())
}

fn error_envelope(status: StatusCode, message: &str) -> warp::reply::Response {
    let body = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "error": message,
        "httpStatus": status.as_u16(),
    });
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

/// Everything warp itself rejects funnels into the same envelope shape.
async fn handle_rejection(err: warp::Rejection) -> Result<warp::reply::Response, Infallible> {
    use warp::filters::body::BodyDeserializeError;
    use warp::filters::cors::CorsForbidden;
    use warp::reject::{InvalidQuery, MethodNotAllowed};

    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "resource not found".to_string())
    } else if let Some(forbidden) = err.find::<CorsForbidden>() {
        (StatusCode::FORBIDDEN, forbidden.to_string())
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Invalid Payload: {}", e),
        )
    } else if err.find::<InvalidQuery>().is_some() {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Invalid Payload: query string must carry a urlencoded JSON object".to_string(),
        )
    } else if let Some(e) = err.find::<MethodNotAllowed>() {
        (StatusCode::METHOD_NOT_ALLOWED, e.to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    };

    if status != StatusCode::NOT_FOUND {
        error!("Request rejected: {}", message);
    }
    Ok(error_envelope(status, &message))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
