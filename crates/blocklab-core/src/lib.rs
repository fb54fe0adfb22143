use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no output from worker")]
    EmptyOutput,
    #[error("could not parse worker output as structured data")]
    Malformed(#[source] serde_json::Error),
}

/// Raw capture of one worker run, byte-for-byte as the process produced it
/// (lossy UTF-8 conversion only). A signal termination carries exit code -1.
#[derive(Debug, Clone)]
pub struct RawWorkerOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The worker's single result record, decoded from its last stdout line.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub ok: bool,
    pub origin: Option<String>,
    pub errors: Vec<String>,
    /// Full decoded record; extra fields ride along for diagnostics.
    pub payload: Value,
}

/// Extracts the result record from the worker's stdout. The contract is one
/// JSON line, but producers log noise first, so only the last non-blank line
/// is authoritative.
pub fn parse_worker_stdout(stdout: &str) -> Result<WorkerReport, ProtocolError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyOutput);
    }
    let line = trimmed
        .lines()
        .rev()
        .find(|candidate| !candidate.trim().is_empty())
        .unwrap_or(trimmed);
    let payload: Value = serde_json::from_str(line.trim()).map_err(ProtocolError::Malformed)?;
    Ok(WorkerReport::from_payload(payload))
}

impl WorkerReport {
    fn from_payload(payload: Value) -> Self {
        let ok = truthy(payload.get("ok"));
        let origin = payload.get("origin").and_then(scalar_text);
        let errors = payload
            .get("errors")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().map(error_text).collect())
            .unwrap_or_default();
        Self {
            ok,
            origin,
            errors,
            payload,
        }
    }
}

// Loose producers send ok as 1 or "true"; anything non-truthy is a failure.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(Value::Null) | None => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn error_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// One run's parsed report joined with its process capture.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub ok: bool,
    pub origin: Option<String>,
    pub errors: Vec<String>,
    pub payload: Value,
    pub exit_code: i32,
    pub stderr: String,
}

impl WorkerOutcome {
    pub fn new(report: WorkerReport, raw: &RawWorkerOutput) -> Self {
        Self {
            ok: report.ok,
            origin: report.origin,
            errors: report.errors,
            payload: report.payload,
            exit_code: raw.exit_code,
            stderr: raw.stderr.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub success: bool,
    pub exit_code: i32,
}

impl Verdict {
    pub fn from_outcome(outcome: &WorkerOutcome) -> Self {
        if outcome.ok {
            Self {
                success: true,
                exit_code: 0,
            }
        } else {
            Self {
                success: false,
                exit_code: failure_exit_code(outcome.exit_code),
            }
        }
    }

    /// Verdict for a run whose output never decoded into a report.
    pub fn protocol_failure(worker_exit_code: i32) -> Self {
        Self {
            success: false,
            exit_code: failure_exit_code(worker_exit_code),
        }
    }
}

/// A worker that exits 0 without a success report is still a failure, so a
/// zero exit code falls back to 1 rather than wrongly implying success.
pub fn failure_exit_code(worker_exit_code: i32) -> i32 {
    if worker_exit_code != 0 {
        worker_exit_code
    } else {
        1
    }
}

/// Ordered mutation commands, replayed by the worker in insertion order.
/// No syntax validation happens here; bad commands surface through the
/// worker's reported errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBatch {
    commands: Vec<String>,
}

impl CommandBatch {
    pub fn from_text(text: &str) -> Self {
        let commands = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        Self { commands }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sorted: Vec<(&String, &Value)> = fields.iter().collect();
            sorted.sort_by_key(|(key, _)| key.as_str());
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, field)| (key.clone(), canonicalize(field)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
