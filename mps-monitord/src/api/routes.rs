use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use shared::types::{ChannelInfo, FreshnessVector, ServiceIdentity, TripEvent};
use crate::poll::ViewSignal;
use crate::record::{IdentitySummary, RecordStatus, RemoteRecord};
use crate::registry::RegistryHandle;
use crate::selection::{Selection, SelectionEvent};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub selection: Selection,
    pub view_rx: watch::Receiver<ViewSignal>,
    /// Ends long-lived event streams so graceful shutdown can finish
    pub shutdown: CancellationToken,
}

#[derive(Serialize)]
pub struct ServiceDetail {
    #[serde(flatten)]
    pub summary: IdentitySummary,
    pub categories: Option<Vec<String>>,
    pub status: RecordStatus,
}

#[derive(Serialize)]
pub struct CategoryView {
    pub index: usize,
    pub name: String,
    pub freshness: Option<FreshnessVector>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub first_hit_summary: Option<String>,
    pub trip_summary: Option<String>,
    pub latest_events: Option<Vec<TripEvent>>,
    pub channels: Option<Vec<ChannelInfo>>,
    pub input_channels: Option<Vec<ChannelInfo>>,
}

#[derive(Deserialize)]
pub struct ReloadQuery {
    pub category: Option<usize>,
}

#[derive(Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionView {
    pub identity: Option<ServiceIdentity>,
    pub category: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:identity", get(get_service))
        .route("/v1/services/:identity/categories/:index", get(get_category))
        .route("/v1/services/:identity/reload", post(post_reload))
        .route("/v1/services/:identity/shutdown", post(post_shutdown))
        .route("/v1/selection", get(get_selection).put(put_selection))
        .route("/v1/selection/events", get(selection_events))
        .with_state(state)
}

fn lookup(state: &AppState, identity: String) -> Result<Arc<RemoteRecord>, StatusCode> {
    state
        .registry
        .find(&ServiceIdentity::new(identity))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_services(State(state): State<AppState>) -> Json<Vec<IdentitySummary>> {
    let snapshot = state.registry.snapshot();
    let mut summaries = Vec::with_capacity(snapshot.len());
    for record in snapshot.iter() {
        summaries.push(record.identity_summary().await);
    }
    Json(summaries)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.view_rx.borrow().digest.clone()
}

async fn get_service(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<ServiceDetail>, StatusCode> {
    let record = lookup(&state, identity)?;
    Ok(Json(ServiceDetail {
        summary: record.identity_summary().await,
        categories: record.categories().await,
        status: record.status(),
    }))
}

async fn get_category(
    State(state): State<AppState>,
    Path((identity, index)): Path<(String, usize)>,
) -> Result<Json<CategoryView>, StatusCode> {
    let record = lookup(&state, identity)?;
    let categories = record.categories().await.ok_or_else(|| {
        tracing::warn!("Categories of {} unavailable", record.identity());
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    let name = categories.get(index).cloned().ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(CategoryView {
        index,
        name,
        freshness: record.freshness(index),
        last_event_time: record.last_event_time(index),
        first_hit_summary: record.first_hit_summary(index).await,
        trip_summary: record.trip_summary(index).await,
        latest_events: record.latest_events(index).await,
        channels: record.channels(index).await,
        input_channels: record.input_channels(index).await,
    }))
}

async fn post_reload(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(params): Query<ReloadQuery>,
) -> Result<StatusCode, StatusCode> {
    let record = lookup(&state, identity)?;
    tokio::spawn(async move {
        match params.category {
            Some(category) => record.request_reload(category).await,
            None => record.request_reload_all().await,
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn post_shutdown(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(request): Json<ShutdownRequest>,
) -> Result<StatusCode, StatusCode> {
    let record = lookup(&state, identity)?;
    tokio::spawn(async move { record.request_shutdown(request.code).await });
    Ok(StatusCode::ACCEPTED)
}

fn selection_view(selection: &Selection) -> SelectionView {
    SelectionView {
        identity: selection.selected_record().map(|r| r.identity().clone()),
        category: selection.selected_category(),
    }
}

async fn get_selection(State(state): State<AppState>) -> Json<SelectionView> {
    Json(selection_view(&state.selection))
}

async fn put_selection(
    State(state): State<AppState>,
    Json(request): Json<SelectionView>,
) -> Result<Json<SelectionView>, StatusCode> {
    let record = match &request.identity {
        Some(identity) => Some(state.registry.find(identity).ok_or(StatusCode::NOT_FOUND)?),
        None => None,
    };

    select_live(&state, record, &request)?;
    Ok(Json(selection_view(&state.selection)))
}

/// Select `record` unless it left the registry in the meantime.
fn select_live(
    state: &AppState,
    record: Option<Arc<RemoteRecord>>,
    request: &SelectionView,
) -> Result<(), StatusCode> {
    let current = state.selection.selected_record().map(|r| r.identity().clone());
    if current != request.identity {
        state.selection.select_record(record);
    }

    // A removal between lookup and select already ran its forget
    if let Some(identity) = &request.identity {
        if state.registry.find(identity).is_none() {
            state.selection.forget(identity);
            return Err(StatusCode::NOT_FOUND);
        }
    }
    state.selection.select_category(request.category);
    Ok(())
}

/// Selection changes and selected-category updates as server-sent events.
async fn selection_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = stream::unfold(state.selection.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Selection observer lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .take_until(state.shutdown.cancelled_owned())
    .map(|event| to_sse(&event));

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_sse(event: &SelectionEvent) -> Result<Event, axum::Error> {
    let name = match event {
        SelectionEvent::RecordSelected(_) => "record-selected",
        SelectionEvent::CategorySelected(_) => "category-selected",
        SelectionEvent::Updated(_) => "updated",
    };
    Event::default().event(name).json_data(event)
}
