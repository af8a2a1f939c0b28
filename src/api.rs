use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{handler, manager::StreamManager};

pub(crate) fn app_router(manager: Arc<StreamManager>) -> Router {
    Router::new()
        .route("/", get(index))
        .nest("/stream", handler::stream::stream_router())
        .nest("/pipe", handler::pipe::pipe_router())
        .with_state(manager)
}

pub(crate) fn start_api_server(
    listen: SocketAddr,
    manager: Arc<StreamManager>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = app_router(manager);

        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Error binding {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error running API server: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "live transcoder"
}
