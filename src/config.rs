use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use fanout_bus::{
    gst::DEFAULT_GST_LAUNCH,
    pipeline::{DEFAULT_CLIENT_QUEUE, PipelineOptions},
    profile::{ProfileKind, TranscoderProfile},
    sink::DEFAULT_FLUSH_THRESHOLD,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_REGISTRY: &str = "registry.json";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen: SocketAddr,
    pub registry: PathBuf,
    pub flush_threshold: usize,
    pub client_queue: usize,
    pub gst_launch: String,
    pub fake_header_limit: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let listen = lookup("TRANSCODE_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("TRANSCODE_LISTEN: invalid address {:?}", listen))?;

        Ok(Self {
            listen,
            registry: lookup("TRANSCODE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY)),
            flush_threshold: parse_number(&lookup, "TRANSCODE_FLUSH_BYTES")?
                .unwrap_or(DEFAULT_FLUSH_THRESHOLD),
            client_queue: parse_number(&lookup, "TRANSCODE_CLIENT_QUEUE")?
                .unwrap_or(DEFAULT_CLIENT_QUEUE),
            gst_launch: lookup("TRANSCODE_GST_LAUNCH")
                .unwrap_or_else(|| DEFAULT_GST_LAUNCH.to_string()),
            fake_header_limit: parse_number(&lookup, "TRANSCODE_FAKE_HEADER_LIMIT")?,
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            flush_threshold: self.flush_threshold,
            client_queue: self.client_queue,
            fake_header_limit: self.fake_header_limit,
        }
    }
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<usize>> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{}: expected a byte count, got {:?}", key, value)),
        _ => Ok(None),
    }
}

/// Resource name to profile mapping served by the streaming endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub resources: BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub source: String,
    pub profile: ProfileKind,
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Shared entries fan out one pipeline to every request; exclusive ones
    /// get a pipeline per request.
    #[serde(default = "default_shared")]
    pub shared: bool,
    /// Replaces the built-in topology of `profile`.
    #[serde(default)]
    pub template: Option<String>,
}

fn default_shared() -> bool {
    true
}

impl Registry {
    /// A missing file is an empty registry.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::warn!("registry {} not found, serving nothing", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading registry {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing registry {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let registry: Self = serde_json::from_str(raw)?;
        Ok(Self {
            resources: registry
                .resources
                .into_iter()
                .map(|(name, entry)| (normalize(&name).to_string(), entry))
                .collect(),
        })
    }

    pub fn get(&self, resource: &str) -> Option<&RegistryEntry> {
        self.resources.get(normalize(resource))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl RegistryEntry {
    pub fn profile(&self) -> fanout_bus::Result<TranscoderProfile> {
        let mut profile = TranscoderProfile::new(self.profile, &self.source)?;
        if let Some(path) = &self.destination {
            profile = profile.with_destination(path);
        }
        if let Some(template) = &self.template {
            profile = profile.with_template(template);
        }
        Ok(profile)
    }
}

/// Resource names are matched without surrounding slashes.
pub fn normalize(resource: &str) -> &str {
    resource.trim_matches('/')
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
