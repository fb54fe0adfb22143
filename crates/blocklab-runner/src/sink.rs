use anyhow::Result;
use blocklab_core::{canonical_json_digest, CommandBatch, RawWorkerOutput};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::{InvocationSpec, RunEvaluation};

const FACTS_DIR: &str = "facts";
const FACTS_RUNS_FILE: &str = "runs.jsonl";

const RUN_RECORD_SCHEMA_VERSION: &str = "smoke_run_v1";

/// One fact row per harness run, enough to debug a failure without
/// re-running the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub schema_version: String,
    pub started_at: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub timeout_ms: u64,
    pub step_delay_ms: u64,
    pub supplied_commands: usize,
    pub success: bool,
    pub exit_code: i32,
    pub worker_exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_digest: Option<String>,
}

pub fn run_record(
    spec: &InvocationSpec,
    batch: Option<&CommandBatch>,
    raw: &RawWorkerOutput,
    evaluation: &RunEvaluation,
) -> RunRecord {
    let outcome = evaluation.outcome.as_ref();
    RunRecord {
        schema_version: RUN_RECORD_SCHEMA_VERSION.to_string(),
        started_at: Utc::now().to_rfc3339(),
        host: spec.host.clone(),
        port: spec.port,
        username: spec.username.clone(),
        version: spec.version.clone(),
        timeout_ms: spec.timeout_ms,
        step_delay_ms: spec.step_delay_ms,
        supplied_commands: batch.map(CommandBatch::len).unwrap_or(0),
        success: evaluation.verdict.success,
        exit_code: evaluation.verdict.exit_code,
        worker_exit_code: raw.exit_code,
        origin: outcome.and_then(|o| o.origin.clone()),
        errors: outcome.map(|o| o.errors.clone()).unwrap_or_default(),
        payload_digest: outcome.map(|o| canonical_json_digest(&o.payload)),
    }
}

pub trait RunSink {
    fn append_run_record(&mut self, row: &RunRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlRunSink {
    runs_writer: BufWriter<File>,
}

impl JsonlRunSink {
    pub fn new(record_dir: &Path) -> Result<Self> {
        let facts_dir = record_dir.join(FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(facts_dir.join(FACTS_RUNS_FILE))?;
        Ok(Self {
            runs_writer: BufWriter::new(file),
        })
    }
}

impl RunSink for JsonlRunSink {
    fn append_run_record(&mut self, row: &RunRecord) -> Result<()> {
        serde_json::to_writer(&mut self.runs_writer, row)?;
        self.runs_writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.runs_writer.flush()?;
        Ok(())
    }
}
