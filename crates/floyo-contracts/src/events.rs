use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Submitted,
    Status,
    Ready,
    Failed,
}

impl JobEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "job_submitted",
            Self::Status => "job_status",
            Self::Ready => "job_ready",
            Self::Failed => "job_failed",
        }
    }
}

/// Append-only JSONL log of job lifecycle events.
///
/// Each line carries `type`, `session_id` and `ts`; job events also carry
/// `request_id`. Caller payload is merged last and may override them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Writes one `kind` line for `request_id` and returns it.
    pub fn emit_job(
        &self,
        kind: JobEventKind,
        request_id: &str,
        payload: EventPayload,
    ) -> anyhow::Result<Value> {
        let mut line = EventPayload::new();
        line.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        line.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        line.insert(
            "request_id".to_string(),
            Value::String(request_id.to_string()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        line.extend(payload);

        self.append_line(&serde_json::to_string(&line)?)?;
        Ok(Value::Object(line))
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
