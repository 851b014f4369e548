use serde::Deserialize;
use std::io::ErrorKind;
use std::time::Duration;
use zeroize::Zeroize;

use super::prompt::CompletionPrompt;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_LLM_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;

const MAX_ERROR_BODY_CHARS: usize = 200;

/// Why a completion could not be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationFailure {
    /// No credential configured; the service is never contacted.
    NotConfigured,
    TimedOut,
    Transport(String),
    Service { status: u16, message: String },
    Malformed(String),
    Unusable(String),
}

impl std::fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationFailure::NotConfigured => write!(f, "text generation is not configured"),
            GenerationFailure::TimedOut => write!(f, "text generation timed out"),
            GenerationFailure::Transport(msg) => write!(f, "transport error: {}", msg),
            GenerationFailure::Service { status, message } => {
                write!(f, "service returned status {}: {}", status, message)
            }
            GenerationFailure::Malformed(msg) => write!(f, "malformed response: {}", msg),
            GenerationFailure::Unusable(msg) => write!(f, "unusable completion: {}", msg),
        }
    }
}

impl std::error::Error for GenerationFailure {}

/// Text-generation collaborator.
///
/// One synchronous, stateless request per call. Implementations must bound
/// their own latency and must not retry indefinitely.
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn complete(&self, prompt: &CompletionPrompt) -> Result<String, GenerationFailure>;
}

/// Generator used when no credential is available. Always fails, so every
/// report takes the fallback path.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineGenerator;

impl TextGenerator for OfflineGenerator {
    fn name(&self) -> &str {
        "offline"
    }

    fn complete(&self, _prompt: &CompletionPrompt) -> Result<String, GenerationFailure> {
        Err(GenerationFailure::NotConfigured)
    }
}

/// API credential. Zeroized on drop and never printed.
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value.trim().to_string()))
        }
    }

    /// Read a key from the named environment variable.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var).ok().and_then(Self::new)
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmSettings {
    /// OpenAI-compatible API root, e.g. `https://api.groq.com/openai/v1`.
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        }
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionClient {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: ApiKey,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatCompletionClient {
    pub fn new(settings: &LlmSettings, api_key: ApiKey) -> anyhow::Result<Self> {
        let base = url::Url::parse(&settings.base_url)
            .map_err(|e| anyhow::anyhow!("invalid llm base url '{}': {}", settings.base_url, e))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "llm base url must be http(s), got '{}'",
                base.scheme()
            ));
        }
        if settings.timeout.is_zero() {
            return Err(anyhow::anyhow!("llm timeout must be greater than zero"));
        }
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Ok(Self {
            agent,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TextGenerator for ChatCompletionClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(&self, prompt: &CompletionPrompt) -> Result<String, GenerationFailure> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });

        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.api_key.expose()))
            .send_json(body)
            .map_err(map_ureq_error)?;

        let parsed: ChatResponse = response.into_json().map_err(|err| {
            if is_timeout_kind(err.kind()) {
                GenerationFailure::TimedOut
            } else {
                GenerationFailure::Malformed(err.to_string())
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerationFailure::Malformed("response carried no message".to_string()))
    }
}

fn map_ureq_error(err: ureq::Error) -> GenerationFailure {
    match err {
        ureq::Error::Status(status, response) => {
            let message: String = response
                .into_string()
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            GenerationFailure::Service { status, message }
        }
        ureq::Error::Transport(transport) => {
            if is_timeout(&transport) {
                GenerationFailure::TimedOut
            } else {
                GenerationFailure::Transport(transport.to_string())
            }
        }
    }
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    let io_timeout = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(|err| is_timeout_kind(err.kind()));
    io_timeout || transport.to_string().contains("timed out")
}

fn is_timeout_kind(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}
