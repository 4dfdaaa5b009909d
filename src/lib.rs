pub mod auth;
pub mod channels;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod epg;
pub mod error;
pub mod metrics;
pub mod output;
pub mod scheduler;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{info, warn};

use channels::Channel;
use clock::{Clock, SystemClock};
use config::ServerConfig;
use output::{CatchupFormat, PlaylistOptions};
use store::Store;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

struct AppState {
    store: Arc<Store>,
    server: ServerConfig,
    tz: Tz,
    clock: Arc<dyn Clock>,
}

pub fn create_app(store: Arc<Store>, server: ServerConfig, tz: Tz) -> Router {
    create_app_with_clock(store, server, tz, Arc::new(SystemClock))
}

/// Like [`create_app`], with the clock used to resolve "today".
pub fn create_app_with_clock(store: Arc<Store>, server: ServerConfig, tz: Tz, clock: Arc<dyn Clock>) -> Router {
    let state = Arc::new(AppState {
        store,
        server,
        tz,
        clock,
    });

    Router::new()
        .route("/channel/m3u", get(m3u_handler))
        .route("/channel/txt", get(txt_handler))
        .route("/epg/json", get(json_epg_handler))
        .route("/epg/xml", get(xml_epg_handler))
        .route("/api/channels", get(channels_api_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    (StatusCode::NOT_FOUND, "Not found")
}

#[derive(Deserialize)]
struct PlaylistQuery {
    #[serde(rename = "multiFirst")]
    multi_first: Option<String>,
    #[serde(rename = "csFormat")]
    cs_format: Option<String>,
}

impl AppState {
    fn playlist_options(&self, query: &PlaylistQuery) -> PlaylistOptions {
        PlaylistOptions {
            relay: self.server.udpxy_url.clone(),
            // Unparseable values fall back to multicast first.
            multicast_first: query
                .multi_first
                .as_deref()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(true),
            catchup: CatchupFormat::from_query(query.cs_format.as_deref()),
            logo_base_url: self.server.logo_base_url.clone(),
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.tz).date_naive()
    }
}

async fn m3u_handler(State(state): State<Arc<AppState>>, Query(query): Query<PlaylistQuery>) -> Response {
    let snapshot = state.store.snapshot();
    if snapshot.channels.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = output::to_m3u(&snapshot.channels, &state.playlist_options(&query));
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

async fn txt_handler(State(state): State<Arc<AppState>>, Query(query): Query<PlaylistQuery>) -> Response {
    let snapshot = state.store.snapshot();
    if snapshot.channels.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = output::to_txt(&snapshot.channels, &state.playlist_options(&query));
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

#[derive(Deserialize)]
struct JsonEpgQuery {
    ch: Option<String>,
    date: Option<String>,
}

async fn json_epg_handler(State(state): State<Arc<AppState>>, Query(query): Query<JsonEpgQuery>) -> Response {
    let Some(channel_name) = query.ch.filter(|c| !c.is_empty()) else {
        warn!("The name of the channel is empty");
        return StatusCode::BAD_REQUEST.into_response();
    };
    let date = match query.date.as_deref() {
        None | Some("") => state.today(),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(e) => {
                warn!("Invalid date: date={} err={}", raw, e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        },
    };
    let snapshot = state.store.snapshot();
    Json(output::to_json_epg(&snapshot.epg, &channel_name, date)).into_response()
}

#[derive(Deserialize)]
struct XmlEpgQuery {
    #[serde(rename = "backDay")]
    back_day: Option<String>,
}

async fn xml_epg_handler(State(state): State<Arc<AppState>>, Query(query): Query<XmlEpgQuery>) -> Response {
    let back_days = query
        .back_day
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let snapshot = state.store.snapshot();
    match output::to_xmltv(&snapshot.epg, back_days, state.today(), &state.tz) {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/xml; charset=utf-8")], xml).into_response(),
        Err(e) => {
            warn!("Failed to render XMLTV: err={}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn channels_api_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Channel>> {
    Json(state.store.snapshot().channels.clone())
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
