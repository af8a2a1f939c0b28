use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use fanout_bus::TranscodeError;

use crate::{
    handler::{ApiError, ApiResult},
    manager::StreamManager,
};

/// Attempts at joining a shared pipeline that terminated under us.
const ATTACH_ATTEMPTS: usize = 2;

pub fn stream_router() -> Router<Arc<StreamManager>> {
    Router::new()
        .route("/{resource}", get(get_stream).head(head_stream))
        .route(
            "/{resource}/{*rest}",
            get(get_nested_stream).head(head_nested_stream),
        )
}

async fn get_stream(
    State(manager): State<Arc<StreamManager>>,
    Path(resource): Path<String>,
) -> ApiResult<Response> {
    open_stream(&manager, &resource).await
}

async fn get_nested_stream(
    State(manager): State<Arc<StreamManager>>,
    Path((resource, _rest)): Path<(String, String)>,
) -> ApiResult<Response> {
    open_stream(&manager, &resource).await
}

async fn head_stream(
    State(manager): State<Arc<StreamManager>>,
    Path(resource): Path<String>,
) -> ApiResult<Response> {
    describe_stream(&manager, &resource)
}

async fn head_nested_stream(
    State(manager): State<Arc<StreamManager>>,
    Path((resource, _rest)): Path<(String, String)>,
) -> ApiResult<Response> {
    describe_stream(&manager, &resource)
}

/// Headers are only sent once the client is attached; anything failing before
/// that still gets a proper status.
async fn open_stream(manager: &Arc<StreamManager>, resource: &str) -> ApiResult<Response> {
    for _ in 0..ATTACH_ATTEMPTS {
        let Some(pipe) = manager.resolve_or_create(resource).await? else {
            return Err(ApiError::not_found(resource));
        };
        match pipe.attach().await {
            Ok(stream) => {
                log::info!("{}: streaming to client {}", pipe.resource(), stream.id());
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, pipe.content_type())
                    .body(Body::from_stream(stream))?;
                return Ok(response);
            }
            Err(TranscodeError::Terminated) => {
                log::debug!("{}: pipeline ended before attach, retrying", resource);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(TranscodeError::Terminated.into())
}

fn describe_stream(manager: &StreamManager, resource: &str) -> ApiResult<Response> {
    let Some(profile) = manager.profile(resource)? else {
        return Err(ApiError::not_found(resource));
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, profile.content_type())],
    )
        .into_response())
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
