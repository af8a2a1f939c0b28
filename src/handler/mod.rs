use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fanout_bus::TranscodeError;

pub mod pipe;
pub mod stream;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn not_found(resource: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: anyhow::anyhow!("not found: {}", resource),
        }
    }
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<TranscodeError>() {
        Some(TranscodeError::Terminated | TranscodeError::ClientQueueFull { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::warn!("ApiError: {:#}", self.error);
        (self.status, self.error.to_string()).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}
