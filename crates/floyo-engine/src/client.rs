//! Submit-then-poll client for the FLUX.2 job API.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use floyo_contracts::config::Flux2Config;
use floyo_contracts::events::{EventPayload, EventWriter, JobEventKind};
use floyo_contracts::receipts::{build_job_receipt, JobRecord};
use floyo_contracts::request::{strip_empty, JobStatus, Payload, PollResult, SubmissionResult};
use floyo_contracts::variants::Flux2Variant;
use floyo_contracts::{Flux2Error, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Wire access used by [`JobClient`]. Implementations attach credentials to
/// API calls; `get_bytes` fetches result files and sends no credentials.
pub trait JobTransport: Send + Sync {
    fn post_json(&self, url: &str, body: &Value) -> Result<Value>;
    fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value>;
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpTransport {
    http: HttpClient,
    api_key: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Fails with a configuration error when no API key was resolved.
    pub fn new(config: &Flux2Config) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(),
            api_key: config.api_key()?.to_string(),
            request_timeout: config.request_timeout(),
        })
    }
}

impl JobTransport for HttpTransport {
    fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header("x-key", &self.api_key)
            .json(body)
            .timeout(self.request_timeout)
            .send()
            .map_err(|err| Flux2Error::transport(url, err))?;
        response_json_or_error(url, response)
    }

    fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .header("x-key", &self.api_key)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .map_err(|err| Flux2Error::transport(url, err))?;
        response_json_or_error(url, response)
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .map_err(|err| Flux2Error::transport(url, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Flux2Error::Status {
                url: url.to_string(),
                code: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        let bytes = response
            .bytes()
            .map_err(|err| Flux2Error::transport(url, err))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn from_config(config: &Flux2Config) -> Self {
        Self {
            timeout: config.poll_timeout(),
            interval: config.poll_interval(),
        }
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub sample: String,
    pub cost: Option<f64>,
    /// Body that was actually sent, after stripping.
    pub payload: Payload,
    /// Raw submission response.
    pub request: Value,
    /// Raw final poll response.
    pub result: Value,
}

impl RunResult {
    pub fn receipt(&self, endpoint: &str, image_path: Option<&std::path::Path>) -> Value {
        build_job_receipt(
            JobRecord {
                endpoint,
                request: &self.payload,
                submission: &self.request,
                result: &self.result,
                sample_url: Some(&self.sample),
                cost: self.cost,
            },
            image_path,
        )
    }
}

#[derive(Clone)]
pub struct JobClient {
    endpoint: String,
    transport: Arc<dyn JobTransport>,
    poll: PollSettings,
    events: Option<EventWriter>,
}

impl JobClient {
    /// HTTP client for `variant`; a missing API key is a configuration error.
    pub fn new(config: &Flux2Config, variant: Flux2Variant) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::with_transport(
            config.base_url(variant),
            Arc::new(transport),
            PollSettings::from_config(config),
        ))
    }

    pub fn with_transport(
        endpoint: impl Into<String>,
        transport: Arc<dyn JobTransport>,
        poll: PollSettings,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            poll,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> &dyn JobTransport {
        self.transport.as_ref()
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    /// Sends the non-empty fields of `payload` and returns the job handle.
    pub fn submit(&self, payload: &Payload) -> Result<SubmissionResult> {
        let body = strip_empty(payload);
        debug!(endpoint = %self.endpoint, fields = body.len(), "submitting FLUX.2 request");
        let response = self
            .transport
            .post_json(&self.endpoint, &Value::Object(body))?;
        let submission = SubmissionResult::from_response(response)?;
        info!(request_id = %submission.id, "FLUX.2 request submitted");
        let mut event = EventPayload::new();
        event.insert("endpoint".to_string(), json!(self.endpoint));
        event.insert("polling_url".to_string(), json!(submission.polling_url));
        event.insert("cost".to_string(), json!(submission.cost));
        self.emit(JobEventKind::Submitted, &submission.id, event);
        Ok(submission)
    }

    /// Polls `polling_url` until the job is ready, fails, or `timeout` passes.
    ///
    /// The deadline is checked before every request, so nothing is sent once
    /// it has passed.
    pub fn poll(
        &self,
        polling_url: &str,
        request_id: Option<&str>,
        timeout: Duration,
        interval: Duration,
    ) -> Result<PollResult> {
        let request_id = request_id.map(str::trim).filter(|id| !id.is_empty());
        let query: Vec<(&str, &str)> = request_id.map(|id| vec![("id", id)]).unwrap_or_default();
        let event_id = request_id.unwrap_or_default();
        let started = Instant::now();
        let mut last_status: Option<String> = None;

        loop {
            if started.elapsed() >= timeout {
                let mut event = EventPayload::new();
                event.insert("reason".to_string(), json!("timeout"));
                event.insert("timeout_s".to_string(), json!(timeout.as_secs_f64()));
                self.emit(JobEventKind::Failed, event_id, event);
                return Err(Flux2Error::Timeout {
                    seconds: timeout.as_secs_f64(),
                });
            }

            let poll = PollResult::from_response(self.transport.get_json(polling_url, &query)?);
            if last_status.as_deref() != Some(poll.status.label()) {
                info!(request_id = %event_id, status = %poll.status.label(), "FLUX.2 job status");
                let mut event = EventPayload::new();
                event.insert("status".to_string(), json!(poll.status.label()));
                event.insert(
                    "elapsed_s".to_string(),
                    json!(started.elapsed().as_secs_f64()),
                );
                self.emit(JobEventKind::Status, event_id, event);
                last_status = Some(poll.status.label().to_string());
            }

            match &poll.status {
                JobStatus::Ready => {
                    let mut event = EventPayload::new();
                    event.insert("sample".to_string(), json!(poll.sample));
                    self.emit(JobEventKind::Ready, event_id, event);
                    return Ok(poll);
                }
                JobStatus::Failed(status) => {
                    let mut event = EventPayload::new();
                    event.insert("reason".to_string(), json!("status"));
                    event.insert("status".to_string(), json!(status));
                    self.emit(JobEventKind::Failed, event_id, event);
                    return Err(Flux2Error::GenerationFailed {
                        status: status.clone(),
                        payload: poll.raw,
                    });
                }
                JobStatus::Pending(_) => {}
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                thread::sleep(interval.min(remaining));
            }
        }
    }

    /// `submit` followed by `poll` with this client's poll settings.
    pub fn run(&self, payload: &Payload) -> Result<RunResult> {
        let sent = strip_empty(payload);
        let submission = self.submit(&sent)?;
        let poll = self.poll(
            &submission.polling_url,
            Some(&submission.id),
            self.poll.timeout,
            self.poll.interval,
        )?;
        let sample = poll.sample.ok_or_else(|| {
            Flux2Error::Protocol("ready response did not include result.sample".to_string())
        })?;
        Ok(RunResult {
            sample,
            cost: submission.cost,
            payload: sent,
            request: submission.raw,
            result: poll.raw,
        })
    }

    fn emit(&self, kind: JobEventKind, request_id: &str, payload: EventPayload) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit_job(kind, request_id, payload) {
            warn!(error = %err, event = kind.as_str(), "failed to write job event");
        }
    }
}

fn response_json_or_error(url: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| Flux2Error::transport(url, err))?;
    if !status.is_success() {
        return Err(Flux2Error::Status {
            url: url.to_string(),
            code: status.as_u16(),
            body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
        });
    }
    serde_json::from_str(&body)
        .map_err(|err| Flux2Error::Protocol(format!("invalid JSON from {url}: {err}")))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
