use std::path::Path;

use serde_json::{json, Map, Value};

use crate::request::Payload;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Everything one job exchanged with the API, minus inline image data.
#[derive(Debug, Clone, Copy)]
pub struct JobRecord<'a> {
    pub endpoint: &'a str,
    pub request: &'a Payload,
    pub submission: &'a Value,
    pub result: &'a Value,
    pub sample_url: Option<&'a str>,
    pub cost: Option<f64>,
}

pub fn build_job_receipt(record: JobRecord<'_>, image_path: Option<&Path>) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert("endpoint".to_string(), json!(record.endpoint));
    root.insert(
        "request".to_string(),
        sanitize_payload(&Value::Object(record.request.clone())),
    );
    root.insert("submission".to_string(), sanitize_payload(record.submission));
    root.insert("result".to_string(), sanitize_payload(record.result));
    root.insert("sample_url".to_string(), json!(record.sample_url));
    root.insert("cost".to_string(), json!(record.cost));
    if let Some(path) = image_path {
        root.insert(
            "image_path".to_string(),
            Value::String(path.to_string_lossy().to_string()),
        );
    }
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if lowered.starts_with("input_image") || matches!(lowered.as_str(), "image" | "data")
                {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{build_job_receipt, write_receipt, JobRecord, RECEIPT_SCHEMA_VERSION};
    use crate::request::Payload;

    #[test]
    fn receipt_omits_inline_images_and_keeps_job_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipts").join("job-1.json");
        let image_path = temp.path().join("out.png");

        let request: Payload = json!({
            "prompt": "harbor at night",
            "input_image": "iVBORw0KGgo=",
            "input_image_2": "iVBORw0KGgo=",
            "seed": 7,
        })
        .as_object()
        .cloned()
        .unwrap_or_default();
        let submission = json!({"id": "req-1", "polling_url": "https://api.test/poll", "cost": 4.0});
        let result = json!({"status": "Ready", "result": {"sample": "https://cdn.test/a.jpeg"}});

        let payload = build_job_receipt(
            JobRecord {
                endpoint: "https://api.test/v1/flux-2-pro",
                request: &request,
                submission: &submission,
                result: &result,
                sample_url: Some("https://cdn.test/a.jpeg"),
                cost: Some(4.0),
            },
            Some(&image_path),
        );
        write_receipt(&receipt_path, &payload)?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&receipt_path)?)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["prompt"], "harbor at night");
        assert_eq!(parsed["request"]["input_image"], "<omitted>");
        assert_eq!(parsed["request"]["input_image_2"], "<omitted>");
        assert_eq!(parsed["submission"]["id"], "req-1");
        assert_eq!(parsed["result"]["result"]["sample"], "https://cdn.test/a.jpeg");
        assert_eq!(parsed["cost"], 4.0);
        assert_eq!(parsed["image_path"], json!(image_path.to_string_lossy()));
        Ok(())
    }
}
