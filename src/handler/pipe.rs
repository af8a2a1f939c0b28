use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::{
    handler::{ApiError, ApiJsonResult},
    manager::{PipeInfo, StreamManager},
};

pub fn pipe_router() -> Router<Arc<StreamManager>> {
    Router::new()
        .route("/", get(index))
        .route("/list", get(list_pipes))
        .route("/status/{resource}", get(get_pipe_status))
}

async fn index() -> &'static str {
    "pipe route!"
}

async fn list_pipes(State(manager): State<Arc<StreamManager>>) -> Json<Vec<PipeInfo>> {
    Json(manager.list().await)
}

async fn get_pipe_status(
    State(manager): State<Arc<StreamManager>>,
    Path(resource): Path<String>,
) -> ApiJsonResult<PipeInfo> {
    match manager.status(&resource).await {
        Some(info) => Ok(Json(info)),
        None => Err(ApiError::not_found(&resource)),
    }
}
