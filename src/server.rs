//! HTTP surface over a loaded archive.
//!
//! `POST /localize` and `POST /localize/top?k=N` take the raw image as the request
//! body. `GET /health` reports the archive shape.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::Filter;

use crate::config::{MAX_IMAGE_BYTES, MAX_TOP_K};
use crate::error::GeoError;
use crate::model::FeatureArchive;
use crate::service::{GeolocationQueryService, QueryResponse, RankedMatch};

#[derive(Clone)]
pub struct AppState {
    pub service: GeolocationQueryService,
    pub archive: Arc<FeatureArchive>,
}

#[derive(Debug, Deserialize)]
struct TopQuery {
    k: Option<usize>,
}

#[derive(Serialize)]
struct TopResponse {
    matches: Vec<RankedMatch>,
}

#[derive(Serialize)]
struct Health {
    records: usize,
    dimension: usize,
    metric: String,
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // 1. POST /localize
    let localize = warp::post()
    .and(warp::path("localize"))
    .and(warp::path::end())
    .and(warp::body::content_length_limit(MAX_IMAGE_BYTES))
    .and(warp::body::bytes())
    .and(with_state(state.clone()))
    .and_then(|body: Bytes, state: AppState| async move {
        let outcome = state.service.locate_in(body.to_vec(), state.archive.clone()).await;
        let status = match &outcome {
            Ok(_) => StatusCode::OK,
            Err(e) => status_for(e),
        };
        let reply = warp::reply::json(&QueryResponse::from(outcome));
        Ok::<_, warp::Rejection>(warp::reply::with_status(reply, status))
    });

    // 2. POST /localize/top?k=N
    let top = warp::post()
    .and(warp::path!("localize" / "top"))
    .and(warp::query::<TopQuery>())
    .and(warp::body::content_length_limit(MAX_IMAGE_BYTES))
    .and(warp::body::bytes())
    .and(with_state(state.clone()))
    .and_then(|query: TopQuery, body: Bytes, state: AppState| async move {
        let k = query.k.unwrap_or(5).min(MAX_TOP_K);
        let reply = match state.service.top_matches(body.to_vec(), state.archive.clone(), k).await {
            Ok(matches) => warp::reply::with_status(warp::reply::json(&TopResponse { matches }), StatusCode::OK),
            Err(e) => {
                let status = status_for(&e);
                let body = QueryResponse::Failed { error: e.to_string() };
                warp::reply::with_status(warp::reply::json(&body), status)
            }
        };
        Ok::<_, warp::Rejection>(reply)
    });

    // 3. GET /health
    let health = warp::get()
    .and(warp::path("health"))
    .and(warp::path::end())
    .and(with_state(state))
    .map(|state: AppState| {
        warp::reply::json(&Health {
            records: state.archive.len(),
            dimension: state.archive.dimension().unwrap_or(0),
            metric: state.service.config().metric.to_string(),
        })
    });

    localize.or(top).or(health)
}

pub async fn serve(state: AppState, addr: SocketAddr) {
    info!(
        "Serving {} records on http://{} (POST /localize, POST /localize/top, GET /health)",
        state.archive.len(),
        addr
    );
    warp::serve(routes(state)).run(addr).await;
}

fn status_for(e: &GeoError) -> StatusCode {
    match e {
        GeoError::ExtractionFailed | GeoError::ExtractionTimeout(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GeoError::DimensionMismatch { .. } | GeoError::InvalidEmbedding => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}
