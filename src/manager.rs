use std::{collections::HashMap, sync::Arc};

use fanout_bus::{
    engine::Engine,
    pipeline::{PipelineHandle, PipelineOptions, PipelineState},
    profile::TranscoderProfile,
};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{self, Registry};

struct PipeEntry {
    handle: PipelineHandle,
    shared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipeInfo {
    pub resource: String,
    pub state: PipelineState,
    pub clients: usize,
    pub bytes_out: u64,
}

impl PipeInfo {
    fn from_handle(handle: &PipelineHandle) -> Self {
        let status = handle.status();
        Self {
            resource: handle.resource().to_string(),
            state: status.state,
            clients: status.clients,
            bytes_out: status.bytes_out,
        }
    }
}

/// Running pipelines keyed by instance id. Shared resources have at most
/// one live instance; exclusive ones get one per request.
pub struct StreamManager {
    engine: Arc<dyn Engine>,
    registry: Registry,
    options: PipelineOptions,
    pipes: RwLock<HashMap<Uuid, PipeEntry>>,
}

impl StreamManager {
    pub fn new(engine: Arc<dyn Engine>, registry: Registry, options: PipelineOptions) -> Self {
        Self {
            engine,
            registry,
            options,
            pipes: RwLock::new(HashMap::new()),
        }
    }

    /// Profile for `resource` without touching any pipeline. `None` when the
    /// resource is not registered.
    pub fn profile(&self, resource: &str) -> anyhow::Result<Option<TranscoderProfile>> {
        match self.registry.get(resource) {
            Some(entry) => Ok(Some(entry.profile()?)),
            None => Ok(None),
        }
    }

    /// Joins the live instance of a shared resource, or builds a new one.
    pub async fn resolve_or_create(
        self: &Arc<Self>,
        resource: &str,
    ) -> anyhow::Result<Option<PipelineHandle>> {
        let Some(entry) = self.registry.get(resource) else {
            return Ok(None);
        };
        let resource = config::normalize(resource);

        let mut pipes = self.pipes.write().await;
        if entry.shared {
            let running = pipes.values().find(|pipe| {
                pipe.shared && pipe.handle.resource() == resource && !pipe.handle.is_terminated()
            });
            if let Some(pipe) = running {
                log::debug!("{}: joining pipeline {}", resource, pipe.handle.id());
                return Ok(Some(pipe.handle.clone()));
            }
        }

        let profile = entry.profile()?;
        let handle =
            PipelineHandle::spawn(resource, &profile, self.engine.as_ref(), &self.options).await?;
        log::info!(
            "{}: created pipeline {} ({:?})",
            resource,
            handle.id(),
            profile.kind()
        );
        pipes.insert(
            handle.id(),
            PipeEntry {
                handle: handle.clone(),
                shared: entry.shared,
            },
        );
        drop(pipes);

        let manager = Arc::clone(self);
        let reaped = handle.clone();
        tokio::spawn(async move {
            reaped.terminated().await;
            manager.pipes.write().await.remove(&reaped.id());
            log::debug!("{}: pipeline {} removed", reaped.resource(), reaped.id());
        });

        Ok(Some(handle))
    }

    pub async fn list(&self) -> Vec<PipeInfo> {
        let pipes = self.pipes.read().await;
        let mut list: Vec<PipeInfo> = pipes
            .values()
            .map(|pipe| PipeInfo::from_handle(&pipe.handle))
            .collect();
        list.sort_by(|a, b| a.resource.cmp(&b.resource));
        list
    }

    pub async fn status(&self, resource: &str) -> Option<PipeInfo> {
        let resource = config::normalize(resource);
        let pipes = self.pipes.read().await;
        pipes
            .values()
            .filter(|pipe| pipe.handle.resource() == resource)
            .min_by_key(|pipe| pipe.handle.is_terminated())
            .map(|pipe| PipeInfo::from_handle(&pipe.handle))
    }

    /// Tears down every running pipeline and waits for them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<PipelineHandle> = self
            .pipes
            .read()
            .await
            .values()
            .map(|pipe| pipe.handle.clone())
            .collect();
        log::info!("shutting down {} pipelines", handles.len());
        for handle in &handles {
            handle.shutdown();
        }
        futures::future::join_all(handles.iter().map(|handle| handle.terminated())).await;
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
