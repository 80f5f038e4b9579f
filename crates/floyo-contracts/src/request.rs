//! Request body and response shapes of the FLUX.2 job API.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Flux2Error, Result};

pub type Payload = Map<String, Value>;

pub const READY_STATUS: &str = "Ready";

pub const FAILURE_STATUSES: [&str; 5] = [
    "Error",
    "Failed",
    "Content Moderated",
    "Request Moderated",
    "Task not found",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = Flux2Error;

    fn from_str(raw: &str) -> Result<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.strip_prefix("image/").unwrap_or(&lowered) {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            other => Err(Flux2Error::Validation(format!(
                "unsupported output format '{other}' (expected jpeg or png)"
            ))),
        }
    }
}

/// One generation or edit request. Unset fields are left out of the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationRequest {
    #[serde(skip_serializing_if = "is_blank")]
    pub prompt: String,
    #[serde(flatten)]
    pub input_images: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_tolerance: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Non-positive dimensions mean "unset".
    pub fn with_dimensions(mut self, width: i64, height: i64) -> Self {
        self.width = positive_u32(width);
        self.height = positive_u32(height);
        self
    }

    /// A negative seed asks the API for a random one.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = u64::try_from(seed).ok();
        self
    }

    pub fn with_input_images(mut self, images: IndexMap<String, String>) -> Self {
        self.input_images.extend(images);
        self
    }

    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => strip_empty(&map),
            _ => Payload::new(),
        }
    }
}

/// Drops keys whose value is null or a string that is blank after trimming.
pub fn strip_empty(payload: &Payload) -> Payload {
    payload
        .iter()
        .filter(|(_, value)| match value {
            Value::Null => false,
            Value::String(text) => !text.trim().is_empty(),
            _ => true,
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Maps a base image and ordered extras onto `input_image`, `input_image_2`, ...
///
/// Extras are numbered by position starting at 2; blank entries are skipped
/// without shifting later ones, and nothing past `max_slot` is kept.
pub fn merge_reference_images<S: AsRef<str>>(
    base: &str,
    extras: &[S],
    max_slot: usize,
) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    let base = base.trim();
    if !base.is_empty() {
        out.insert("input_image".to_string(), base.to_string());
    }
    for (slot, image) in (2..=max_slot).zip(extras.iter()) {
        let value = image.as_ref().trim();
        if !value.is_empty() {
            out.insert(format!("input_image_{slot}"), value.to_string());
        }
    }
    out
}

/// Accepted submission: where to poll and the job id.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionResult {
    pub polling_url: String,
    pub id: String,
    pub cost: Option<f64>,
    pub raw: Value,
}

impl SubmissionResult {
    pub fn from_response(raw: Value) -> Result<Self> {
        let polling_url = raw
            .get("polling_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Flux2Error::Protocol("response did not include a polling_url".to_string())
            })?;
        let id = raw
            .get("id")
            .and_then(scalar_text)
            .ok_or_else(|| {
                Flux2Error::Protocol("response did not include a request id".to_string())
            })?;
        let cost = raw.get("cost").and_then(number_value);
        Ok(Self {
            polling_url,
            id,
            cost,
            raw,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Ready,
    Failed(String),
    Pending(String),
}

impl JobStatus {
    pub fn classify(raw: Option<&str>) -> Self {
        let text = raw.map(str::trim).unwrap_or_default();
        if text.eq_ignore_ascii_case(READY_STATUS) {
            return Self::Ready;
        }
        if FAILURE_STATUSES
            .iter()
            .any(|status| text.eq_ignore_ascii_case(status))
        {
            return Self::Failed(text.to_string());
        }
        Self::Pending(text.to_string())
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Ready => READY_STATUS,
            Self::Failed(text) | Self::Pending(text) => text.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub status: JobStatus,
    pub sample: Option<String>,
    pub raw: Value,
}

impl PollResult {
    pub fn from_response(raw: Value) -> Self {
        let status = JobStatus::classify(raw.get("status").and_then(Value::as_str));
        let sample = raw
            .get("result")
            .and_then(|result| result.get("sample"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Self {
            status,
            sample,
            raw,
        }
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn positive_u32(value: i64) -> Option<u32> {
    u32::try_from(value).ok().filter(|value| *value > 0)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}
