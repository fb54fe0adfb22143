use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "Qwen/Qwen3-4B-Instruct-2507";
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 800;
pub const DEFAULT_DEVICE: &str = "auto";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a Minecraft building agent. \
Output only /fill and /setblock commands, one per line. No extra text.";

pub const HF_TOKEN_ENV: &str = "HF_TOKEN";
pub const HF_HUB_TOKEN_ENV: &str = "HUGGINGFACE_HUB_TOKEN";

pub const DEFAULT_BACKEND_PROGRAM: &str = "python3";
pub const DEFAULT_BACKEND_SCRIPT: &str = "infer/hf_generate.py";

pub const EMPTY_PROMPT_EXIT_CODE: i32 = 2;
pub const BACKEND_LOAD_EXIT_CODE: i32 = 3;

// Backend process contract: exit 3 = load failure, exit 4 = device move
// failure, anything else non-zero = generic generation failure.
const BACKEND_LOAD_FAILURE_EXIT: i32 = 3;
const BACKEND_DEVICE_MOVE_EXIT: i32 = 4;

/// Flag-level generation parameters; every field can be overridden per
/// request by the stdin payload.
#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: u32,
    pub device: String,
    pub hf_token: Option<String>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            device: DEFAULT_DEVICE.to_string(),
            hf_token: None,
        }
    }
}

/// Fully resolved request, after payload overrides, defaults, and the token
/// precedence chain. `device` is still the requested preference; resolution
/// against accelerator availability happens at generation time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub prompt: String,
    pub system: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: u32,
    pub device: String,
    pub hf_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationReply {
    pub text: String,
    pub model: String,
    pub device: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load generation backend: {0}")]
    Load(String),
    #[error("failed to move model to {device}: {detail}")]
    DeviceMove { device: String, detail: String },
    #[error("generation failed: {0}")]
    Generation(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("failed to load generation backend: {0}")]
    BackendLoad(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

impl AdapterError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AdapterError::EmptyPrompt => EMPTY_PROMPT_EXIT_CODE,
            AdapterError::BackendLoad(_) => BACKEND_LOAD_EXIT_CODE,
            AdapterError::Generation(_) => 1,
        }
    }
}

/// One payload on the input channel. An undecodable payload is not an
/// error: the raw text is the instruction itself.
pub fn decode_request_payload(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "prompt": trimmed }),
    }
}

pub fn resolve_request(
    payload: &Value,
    defaults: &GenerationDefaults,
) -> Result<ResolvedRequest, AdapterError> {
    let prompt = text_field(payload, "prompt").unwrap_or_default();
    if prompt.is_empty() {
        return Err(AdapterError::EmptyPrompt);
    }

    let temperature = {
        let candidate = coerce_f64(payload.get("temperature"), defaults.temperature);
        if valid_temperature(candidate) {
            candidate
        } else {
            defaults.temperature
        }
    };
    let top_p = {
        let candidate = coerce_f64(payload.get("top_p"), defaults.top_p);
        if valid_top_p(candidate) {
            candidate
        } else {
            defaults.top_p
        }
    };

    Ok(ResolvedRequest {
        prompt,
        system: text_field(payload, "system")
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        model: text_field(payload, "model").unwrap_or_else(|| defaults.model.clone()),
        temperature,
        top_p,
        max_new_tokens: coerce_u32(payload.get("max_new_tokens"), defaults.max_new_tokens),
        device: text_field(payload, "device").unwrap_or_else(|| defaults.device.clone()),
        hf_token: text_field(payload, "hf_token")
            .or_else(|| defaults.hf_token.clone())
            .or_else(|| env_token(HF_TOKEN_ENV))
            .or_else(|| env_token(HF_HUB_TOKEN_ENV)),
    })
}

fn text_field(payload: &Value, name: &str) -> Option<String> {
    match payload.get(name) {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    }
}

/// Invalid numeric parameters never fail the run; they fall back.
pub fn coerce_f64(value: Option<&Value>, fallback: f64) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(fallback),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

pub fn coerce_u32(value: Option<&Value>, fallback: u32) -> u32 {
    match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .and_then(|wide| u32::try_from(wide).ok())
            .unwrap_or(fallback),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

fn valid_temperature(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn valid_top_p(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= 1.0
}

fn env_token(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Temperature 0 requests deterministic greedy decoding.
pub fn sampling_enabled(temperature: f64) -> bool {
    temperature > 0.0
}

fn wants_cpu(requested: &str) -> bool {
    requested.trim().eq_ignore_ascii_case("cpu")
}

pub fn resolve_device(requested: &str, accelerator_available: bool) -> &'static str {
    if wants_cpu(requested) || !accelerator_available {
        "cpu"
    } else {
        "cuda"
    }
}

/// The text-generation boundary. The empty-prompt check runs before any
/// method here is touched.
pub trait TextBackend {
    fn accelerator_available(&self) -> bool;
    fn generate(
        &self,
        request: &ResolvedRequest,
        device: &str,
    ) -> Result<GenerationReply, BackendError>;
}

/// Drives one generation: decode, resolve, pick a device, and invoke the
/// backend, with a single forced-cpu retry when moving the model to a
/// non-cpu device fails.
pub fn run_generation(
    raw_input: &str,
    defaults: &GenerationDefaults,
    backend: &dyn TextBackend,
    diag: &mut impl Write,
) -> Result<GenerationReply, AdapterError> {
    let payload = decode_request_payload(raw_input);
    let request = resolve_request(&payload, defaults)?;

    // An explicit cpu request skips the accelerator probe entirely.
    let device = if wants_cpu(&request.device) {
        "cpu"
    } else {
        resolve_device(&request.device, backend.accelerator_available())
    };

    match backend.generate(&request, device) {
        Ok(reply) => Ok(reply),
        Err(BackendError::DeviceMove {
            device: failed,
            detail,
        }) if device != "cpu" => {
            let _ = writeln!(
                diag,
                "WARN: failed to move model to {} ({}); falling back to cpu",
                failed, detail
            );
            backend
                .generate(&request, "cpu")
                .map_err(adapter_error_from_backend)
        }
        Err(err) => Err(adapter_error_from_backend(err)),
    }
}

fn adapter_error_from_backend(err: BackendError) -> AdapterError {
    match err {
        BackendError::Load(detail) => AdapterError::BackendLoad(detail),
        other => AdapterError::Generation(other.to_string()),
    }
}

/// The real backend: a subordinate inference process fed one request JSON on
/// stdin, answering with one reply JSON line on stdout. Its stderr flows
/// straight through to the caller's.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    pub program: String,
    pub script: PathBuf,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self {
            program: DEFAULT_BACKEND_PROGRAM.to_string(),
            script: PathBuf::from(DEFAULT_BACKEND_SCRIPT),
        }
    }
}

impl ProcessBackend {
    fn backend_request(&self, request: &ResolvedRequest, device: &str) -> Value {
        json!({
            "prompt": request.prompt,
            "system": request.system,
            "model": request.model,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_new_tokens": request.max_new_tokens,
            "device": device,
            "do_sample": sampling_enabled(request.temperature),
            "hf_token": request.hf_token,
        })
    }
}

impl TextBackend for ProcessBackend {
    fn accelerator_available(&self) -> bool {
        let probe = Command::new(&self.program)
            .arg(&self.script)
            .arg("--probe-device")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();
        match probe {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .trim()
                .eq_ignore_ascii_case("cuda"),
            _ => false,
        }
    }

    fn generate(
        &self,
        request: &ResolvedRequest,
        device: &str,
    ) -> Result<GenerationReply, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| BackendError::Load(format!("{}: {}", self.program, err)))?;
        let request_json = serde_json::to_string(&self.backend_request(request, device))
            .map_err(|err| BackendError::Generation(err.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // The backend may exit (e.g. on load failure) before draining
            // stdin; a broken pipe here is not itself a failure.
            let _ = stdin.write_all(request_json.as_bytes());
        }
        let output = child
            .wait_with_output()
            .map_err(|err| BackendError::Generation(err.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        match output.status.code() {
            Some(0) => decode_backend_reply(&stdout, request, device),
            Some(BACKEND_LOAD_FAILURE_EXIT) => {
                Err(BackendError::Load("backend reported a load failure".to_string()))
            }
            Some(BACKEND_DEVICE_MOVE_EXIT) => Err(BackendError::DeviceMove {
                device: device.to_string(),
                detail: "backend reported a device move failure".to_string(),
            }),
            Some(code) => Err(BackendError::Generation(format!(
                "backend exited with code {}",
                code
            ))),
            None => Err(BackendError::Generation(
                "backend terminated by signal".to_string(),
            )),
        }
    }
}

fn decode_backend_reply(
    stdout: &str,
    request: &ResolvedRequest,
    device: &str,
) -> Result<GenerationReply, BackendError> {
    let line = stdout
        .trim()
        .lines()
        .rev()
        .find(|candidate| !candidate.trim().is_empty())
        .ok_or_else(|| BackendError::Generation("no reply from backend".to_string()))?;
    let payload: Value = serde_json::from_str(line.trim())
        .map_err(|err| BackendError::Generation(format!("unparseable backend reply: {}", err)))?;
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Generation("backend reply missing text".to_string()))?
        .to_string();
    Ok(GenerationReply {
        text,
        model: payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string(),
        device: payload
            .get("device")
            .and_then(Value::as_str)
            .unwrap_or(device)
            .to_string(),
    })
}
