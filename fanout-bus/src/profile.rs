//! Output formats the service can produce.
//!
//! Every profile pairs a topology template of the shape
//! `<source> ! decode ! <transform chain> ! <encode>` with the content type
//! announced to HTTP clients. Templates only depend on the source locator.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    engine::LaunchRequest,
    error::{Result, TranscodeError},
    header::HeaderProbe,
};

pub const SOURCE_PLACEHOLDER: &str = "{source}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Raw signed 16 bit big endian PCM, 44.1kHz stereo.
    Pcm,
    Wav,
    Mp3,
    /// H.264 in MP4 remuxed without re-encoding, behind a fake `ftyp`.
    Mp4,
    Mpegts,
    JpegThumb,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 6] = [
        ProfileKind::Pcm,
        ProfileKind::Wav,
        ProfileKind::Mp3,
        ProfileKind::Mp4,
        ProfileKind::Mpegts,
        ProfileKind::JpegThumb,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProfileKind::Pcm => "pcm",
            ProfileKind::Wav => "wav",
            ProfileKind::Mp3 => "mp3",
            ProfileKind::Mp4 => "mp4",
            ProfileKind::Mpegts => "mpegts",
            ProfileKind::JpegThumb => "jpeg_thumb",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ProfileKind::Pcm => "audio/L16;rate=44100;channels=2",
            ProfileKind::Wav => "audio/x-wav",
            ProfileKind::Mp3 => "audio/mpeg",
            ProfileKind::Mp4 => "video/mp4",
            ProfileKind::Mpegts => "video/mpeg",
            ProfileKind::JpegThumb => "image/jpeg",
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            ProfileKind::Pcm => {
                "{source} ! decodebin ! audioconvert ! audioresample ! \
                 capsfilter name=enc caps=audio/x-raw,format=S16BE,rate=44100,channels=2"
            }
            ProfileKind::Wav => "{source} ! decodebin ! audioconvert ! wavenc name=enc",
            ProfileKind::Mp3 => "{source} ! decodebin ! audioconvert ! lamemp3enc name=enc",
            // remux only: fails unless the input already is H.264 in a
            // QuickTime/MP4 container
            ProfileKind::Mp4 => {
                "{source} ! qtdemux name=d d. ! queue ! h264parse ! \
                 mp4mux streamable=true fragment-duration=1000 name=mux d. ! queue ! mux."
            }
            ProfileKind::Mpegts => {
                "{source} ! decodebin name=d d. ! queue ! videoconvert ! \
                 x264enc tune=zerolatency ! mpegtsmux name=mux d. ! queue ! audioconvert ! \
                 avenc_mp2 ! mux."
            }
            // scale to fit 160x160, aspect preserved through the square pixels
            ProfileKind::JpegThumb => {
                "{source} ! decodebin ! videoconvert ! videoscale ! \
                 video/x-raw,width=[1,160],height=[1,160],pixel-aspect-ratio=1/1 ! \
                 jpegenc snapshot=true name=enc"
            }
        }
    }

    /// Element whose output is the produced byte stream.
    pub fn output_element(&self) -> &'static str {
        match self {
            ProfileKind::Mp4 | ProfileKind::Mpegts => "mux",
            _ => "enc",
        }
    }

    pub fn header_probe(&self) -> HeaderProbe {
        match self {
            ProfileKind::Wav => HeaderProbe::Riff,
            _ => HeaderProbe::None,
        }
    }

    /// Whether the output goes through the fake header rewrite.
    pub fn fake_header(&self) -> bool {
        matches!(self, ProfileKind::Mp4)
    }
}

/// Normalizes a source locator. Bare paths become `file://` URIs, `file://`
/// and `http://` locators pass through, anything else is rejected.
pub fn resolve_source(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TranscodeError::unsupported("empty source locator"));
    }

    if let Some(scheme) = uri_scheme(raw) {
        return match scheme.to_ascii_lowercase().as_str() {
            "file" | "http" => Ok(raw.to_string()),
            other => Err(TranscodeError::unsupported(format!(
                "scheme {:?} in {}",
                other, raw
            ))),
        };
    }

    let path = std::path::absolute(Path::new(raw))?;
    Url::from_file_path(&path)
        .map(String::from)
        .map_err(|_| TranscodeError::unsupported(format!("not a usable path: {}", raw)))
}

/// Scheme of `raw` when it is written as `<scheme>://...`. A scheme is a
/// letter followed by letters, digits, `+`, `-` or `.`.
fn uri_scheme(raw: &str) -> Option<&str> {
    let (scheme, _) = raw.split_once("://")?;
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Immutable description of one transcoding job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderProfile {
    kind: ProfileKind,
    source: String,
    destination: Option<PathBuf>,
    template: Option<String>,
}

impl TranscoderProfile {
    pub fn new(kind: ProfileKind, source: &str) -> Result<Self> {
        Ok(Self {
            kind,
            source: resolve_source(source)?,
            destination: None,
            template: None,
        })
    }

    /// Writes the output to a file instead of broadcasting it.
    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    /// Replaces the built-in topology. The template must contain
    /// `{source}` and name the profile's output element.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn content_type(&self) -> &'static str {
        self.kind.content_type()
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Materializes the topology for the engine.
    pub fn launch_request(&self) -> Result<LaunchRequest> {
        let template = self.template.as_deref().unwrap_or(self.kind.template());
        if !template.contains(SOURCE_PLACEHOLDER) {
            return Err(TranscodeError::build(format!(
                "template has no {} placeholder",
                SOURCE_PLACEHOLDER
            )));
        }

        let description = template.replace(SOURCE_PLACEHOLDER, &self.source);
        if description.split('!').any(|element| element.trim().is_empty()) {
            return Err(TranscodeError::build(format!(
                "empty element in topology: {}",
                description
            )));
        }

        let output = self.kind.output_element();
        let named = format!("name={}", output);
        if !description.split_whitespace().any(|token| token == named) {
            return Err(TranscodeError::build(format!(
                "topology has no element named {:?}",
                output
            )));
        }

        Ok(LaunchRequest {
            description,
            output: output.to_string(),
            header: self.kind.header_probe(),
        })
    }
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod profile_test;
