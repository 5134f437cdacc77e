use crate::modules::config::{env_parse, env_string, env_timeout, ConfigError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OLLAMA_BASE_URL: &str = "http://ollama:11434";
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("unknown LLM provider {0:?} (expected openai|gemini|ollama)")]
    UnknownProvider(String),
    #[error("{provider} auth error: {message}")]
    Auth { provider: String, message: String },
    #[error("{provider} unreachable: {message}")]
    Unreachable { provider: String, message: String },
    #[error("{provider} request timed out")]
    Timeout { provider: String },
    #[error("{provider} request failed: status={status} body={body}")]
    BadStatus {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} response parse failed: {message}")]
    Parse { provider: String, message: String },
}

pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// A chat model reachable over some transport.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError>;

    /// Text chunks in generation order. Providers without native streaming yield the
    /// whole completion as one chunk.
    async fn stream(&self, system: &str, user: &str) -> Result<ChunkStream, LlmError> {
        let text = self.generate(system, user).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::OpenAi, ProviderKind::Gemini, ProviderKind::Ollama];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    pub fn from_env(kind: ProviderKind) -> Result<Self, ConfigError> {
        let cfg = match kind {
            ProviderKind::OpenAi => Self {
                kind,
                model: env_string("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".into()),
                api_key: env_string("OPENAI_API_KEY"),
                base_url: env_string("OPENAI_BASE_URL").unwrap_or_else(|| OPENAI_BASE_URL.into()),
                temperature: env_parse("OPENAI_TEMPERATURE")?.unwrap_or(DEFAULT_TEMPERATURE),
                max_tokens: env_parse("OPENAI_MAX_TOKENS")?,
            },
            ProviderKind::Gemini => Self {
                kind,
                model: env_string("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-flash".into()),
                api_key: env_string("GOOGLE_API_KEY").or_else(|| env_string("GEMINI_API_KEY")),
                base_url: env_string("GEMINI_BASE_URL").unwrap_or_else(|| GEMINI_BASE_URL.into()),
                temperature: env_parse("GEMINI_TEMPERATURE")?.unwrap_or(DEFAULT_TEMPERATURE),
                max_tokens: env_parse("GEMINI_MAX_TOKENS")?,
            },
            ProviderKind::Ollama => Self {
                kind,
                model: env_string("OLLAMA_MODEL").unwrap_or_else(|| "qwen2.5:7b-instruct".into()),
                api_key: None,
                base_url: env_string("OLLAMA_BASE_URL").unwrap_or_else(|| OLLAMA_BASE_URL.into()),
                temperature: env_parse("OLLAMA_TEMPERATURE")?.unwrap_or(DEFAULT_TEMPERATURE),
                max_tokens: None,
            },
        };
        Ok(cfg)
    }
}

/// OpenAI, Gemini and Ollama over their REST APIs. One attempt per call, bounded
/// by the client timeout.
#[derive(Debug, Clone)]
pub struct HttpLlm {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpLlm {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, LlmError> {
        let provider = config.kind.as_str();
        let needs_key = matches!(config.kind, ProviderKind::OpenAi | ProviderKind::Gemini);
        if needs_key && config.api_key.as_deref().map_or(true, str::is_empty) {
            let var = match config.kind {
                ProviderKind::Gemini => "GOOGLE_API_KEY",
                _ => "OPENAI_API_KEY",
            };
            return Err(LlmError::Auth {
                provider: provider.into(),
                message: format!("{var} environment variable is required for the {provider} provider"),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Unreachable {
                provider: provider.into(),
                message: e.to_string(),
            })?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn provider(&self) -> &'static str {
        self.config.kind.as_str()
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    fn request(&self, system: &str, user: &str, streaming: bool) -> reqwest::RequestBuilder {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.kind {
            ProviderKind::OpenAi => {
                let mut body = json!({
                    "model": self.config.model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ],
                    "temperature": self.config.temperature,
                    "stream": streaming,
                });
                if let Some(max) = self.config.max_tokens {
                    body["max_tokens"] = json!(max);
                }
                self.client
                    .post(format!("{base}/chat/completions"))
                    .bearer_auth(self.api_key())
                    .json(&body)
            }
            ProviderKind::Gemini => {
                let mut generation = json!({ "temperature": self.config.temperature });
                if let Some(max) = self.config.max_tokens {
                    generation["maxOutputTokens"] = json!(max);
                }
                let body = json!({
                    "systemInstruction": { "parts": [ { "text": system } ] },
                    "contents": [
                        { "role": "user", "parts": [ { "text": user } ] }
                    ],
                    "generationConfig": generation,
                });
                let url = if streaming {
                    format!("{base}/models/{}:streamGenerateContent?alt=sse", self.config.model)
                } else {
                    format!("{base}/models/{}:generateContent", self.config.model)
                };
                self.client
                    .post(url)
                    .header("x-goog-api-key", self.api_key())
                    .json(&body)
            }
            ProviderKind::Ollama => {
                let body = json!({
                    "model": self.config.model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ],
                    "stream": streaming,
                    "options": { "temperature": self.config.temperature },
                });
                self.client.post(format!("{base}/api/chat")).json(&body)
            }
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, LlmError> {
        let provider = self.provider();
        let resp = req.send().await.map_err(|e| transport_error(provider, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LlmError::Auth {
                provider: provider.into(),
                message: format!("status={status} body={body}"),
            });
        }
        Err(LlmError::BadStatus {
            provider: provider.into(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    fn name(&self) -> &str {
        self.provider()
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let provider = self.provider();
        tracing::debug!(provider, model = %self.config.model, "llm request");
        let resp = self.send(self.request(system, user, false)).await?;
        let body = resp.text().await.map_err(|e| transport_error(provider, e))?;

        let text = match self.config.kind {
            ProviderKind::OpenAi => extract_openai_text(&body),
            ProviderKind::Gemini => extract_candidate_text(&body),
            ProviderKind::Ollama => extract_ollama_text(&body),
        };
        text.map_err(|message| LlmError::Parse {
            provider: provider.into(),
            message,
        })
    }

    async fn stream(&self, system: &str, user: &str) -> Result<ChunkStream, LlmError> {
        let provider = self.provider();
        tracing::debug!(provider, model = %self.config.model, "llm stream request");
        let resp = self.send(self.request(system, user, true)).await?;

        let bytes = resp
            .bytes_stream()
            .map(move |r| r.map(|b| b.to_vec()).map_err(|e| transport_error(provider, e)));
        let kind = self.config.kind;

        let chunks = split_lines(bytes).filter_map(move |line| {
            let out = match line {
                Ok(line) => stream_chunk(kind, &line).map(|r| {
                    r.map_err(|message| LlmError::Parse {
                        provider: provider.into(),
                        message,
                    })
                }),
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(out)
        });
        Ok(chunks.boxed())
    }
}

fn transport_error(provider: &str, e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            provider: provider.into(),
        }
    } else {
        LlmError::Unreachable {
            provider: provider.into(),
            message: e.to_string(),
        }
    }
}

/// Reassembles newline-delimited records from arbitrary byte chunks. A final
/// unterminated line is still emitted.
fn split_lines<S>(inner: S) -> BoxStream<'static, Result<String, LlmError>>
where
    S: Stream<Item = Result<Vec<u8>, LlmError>> + Send + 'static,
{
    struct State {
        inner: BoxStream<'static, Result<Vec<u8>, LlmError>>,
        buf: Vec<u8>,
        eof: bool,
    }

    let init = State {
        inner: inner.boxed(),
        buf: Vec::new(),
        eof: false,
    };

    stream::unfold(init, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line)
                    .trim_end_matches(|c| c == '\r' || c == '\n')
                    .to_string();
                return Some((Ok(text), st));
            }
            if st.eof {
                if st.buf.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&st.buf).trim_end().to_string();
                st.buf.clear();
                return Some((Ok(text), st));
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    st.eof = true;
                    st.buf.clear();
                    return Some((Err(e), st));
                }
                None => st.eof = true,
            }
        }
    })
    .boxed()
}

/// One line of a streaming response to its text delta. `None` skips the line.
fn stream_chunk(kind: ProviderKind, line: &str) -> Option<Result<String, String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let payload = match kind {
        ProviderKind::OpenAi | ProviderKind::Gemini => {
            let data = line.strip_prefix("data:")?.trim();
            if data == "[DONE]" {
                return None;
            }
            data
        }
        ProviderKind::Ollama => line,
    };

    let parsed = match kind {
        ProviderKind::OpenAi => extract_openai_delta(payload),
        ProviderKind::Gemini => extract_candidate_delta(payload),
        ProviderKind::Ollama => extract_ollama_text(payload),
    };
    match parsed {
        Ok(text) if text.is_empty() => None,
        other => Some(other),
    }
}

fn extract_openai_text(body: &str) -> Result<String, String> {
    let v: Value = serde_json::from_str(body).map_err(|e| format!("{e}: {body}"))?;
    v.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing choices[0].message.content: {body}"))
}

fn extract_openai_delta(body: &str) -> Result<String, String> {
    let v: Value = serde_json::from_str(body).map_err(|e| format!("{e}: {body}"))?;
    Ok(v.pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

fn extract_ollama_text(body: &str) -> Result<String, String> {
    #[derive(Deserialize)]
    struct Envelope {
        message: Option<Message>,
        error: Option<String>,
    }
    #[derive(Deserialize)]
    struct Message {
        content: Option<String>,
    }

    let env: Envelope = serde_json::from_str(body).map_err(|e| format!("{e}: {body}"))?;
    if let Some(err) = env.error {
        return Err(err);
    }
    env.message
        .and_then(|m| m.content)
        .ok_or_else(|| format!("missing message.content: {body}"))
}

/// Streamed Gemini frames may carry no text at all (finish reason, usage
/// metadata). Only an `error` object fails the stream.
fn extract_candidate_delta(body: &str) -> Result<String, String> {
    let v: Value = serde_json::from_str(body).map_err(|e| format!("{e}: {body}"))?;
    if let Some(err) = v.get("error") {
        return Err(err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()));
    }
    Ok(v.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default())
}

fn extract_candidate_text(body: &str) -> Result<String, String> {
    #[derive(Deserialize)]
    struct Envelope {
        candidates: Option<Vec<Candidate>>,
    }
    #[derive(Deserialize)]
    struct Candidate {
        content: Option<Content>,
    }
    #[derive(Deserialize)]
    struct Content {
        parts: Option<Vec<Part>>,
    }
    #[derive(Deserialize)]
    struct Part {
        text: Option<String>,
    }

    let env: Envelope = serde_json::from_str(body).map_err(|e| format!("{e}: {body}"))?;
    let parts = env
        .candidates
        .and_then(|mut c| if c.is_empty() { None } else { Some(c.swap_remove(0)) })
        .and_then(|c| c.content)
        .and_then(|c| c.parts)
        .ok_or_else(|| format!("missing candidates.content.parts: {body}"))?;
    Ok(parts.into_iter().filter_map(|p| p.text).collect())
}

/// Providers addressable by name, plus the ones that could not be built (so a
/// request naming them gets the real reason, e.g. a missing key).
#[derive(Clone)]
pub struct ProviderSet {
    default: String,
    available: BTreeMap<String, Arc<dyn LlmProvider>>,
    unavailable: BTreeMap<String, LlmError>,
}

impl ProviderSet {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into().trim().to_ascii_lowercase(),
            available: BTreeMap::new(),
            unavailable: BTreeMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        let name = provider.name().to_ascii_lowercase();
        self.unavailable.remove(&name);
        self.available.insert(name, provider);
        self
    }

    pub fn with_unavailable(mut self, name: impl Into<String>, err: LlmError) -> Self {
        self.unavailable.insert(name.into().to_ascii_lowercase(), err);
        self
    }

    /// `LLM_PROVIDER` picks the default (ollama when unset). Every known provider is
    /// configured; ones missing credentials are kept as unavailable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = env_string("LLM_PROVIDER").unwrap_or_else(|| "ollama".into());
        let default_kind: ProviderKind = default.parse().map_err(|e: LlmError| ConfigError::Invalid {
            key: "LLM_PROVIDER",
            value: default.clone(),
            reason: e.to_string(),
        })?;
        let timeout = env_timeout("LLM_HTTP_TIMEOUT_SECS", 60, 5, 300);

        let mut set = Self::new(default_kind.as_str());
        for kind in ProviderKind::ALL {
            let config = ProviderConfig::from_env(kind)?;
            set = match HttpLlm::new(config, timeout) {
                Ok(llm) => set.with_provider(Arc::new(llm)),
                Err(e) => {
                    if kind == default_kind {
                        tracing::warn!(provider = %kind, "default LLM provider unavailable: {e}");
                    }
                    set.with_unavailable(kind.as_str(), e)
                }
            };
        }
        Ok(set)
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// `None` or blank selects the default provider. Aliases accepted by
    /// [`ProviderKind`] resolve to the canonical name.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let raw = name
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default);
        let name = match raw.parse::<ProviderKind>() {
            Ok(kind) => kind.as_str().to_string(),
            Err(_) => raw.to_ascii_lowercase(),
        };

        if let Some(p) = self.available.get(&name) {
            return Ok(Arc::clone(p));
        }
        if let Some(e) = self.unavailable.get(&name) {
            return Err(e.clone());
        }
        Err(LlmError::UnknownProvider(name))
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("default", &self.default)
            .field("available", &self.available.keys().collect::<Vec<_>>())
            .field("unavailable", &self.unavailable.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl LlmProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            Ok(user.to_string())
        }
    }

    #[test]
    fn provider_kind_parses() {
        assert_eq!(" OpenAI ".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Gemini);
        assert!(matches!(
            "claude".parse::<ProviderKind>(),
            Err(LlmError::UnknownProvider(n)) if n == "claude"
        ));
    }

    #[test]
    fn missing_key_is_auth_error() {
        let cfg = ProviderConfig {
            kind: ProviderKind::OpenAi,
            model: "gpt-4o".into(),
            api_key: None,
            base_url: OPENAI_BASE_URL.into(),
            temperature: 0.7,
            max_tokens: None,
        };
        let err = HttpLlm::new(cfg, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, LlmError::Auth { .. }));
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn ollama_needs_no_key() {
        let cfg = ProviderConfig {
            kind: ProviderKind::Ollama,
            model: "qwen2.5:7b-instruct".into(),
            api_key: None,
            base_url: OLLAMA_BASE_URL.into(),
            temperature: 0.7,
            max_tokens: None,
        };
        assert_eq!(HttpLlm::new(cfg, Duration::from_secs(5)).unwrap().name(), "ollama");
    }

    #[test]
    fn provider_set_lookup() {
        let set = ProviderSet::new("echo")
            .with_provider(Arc::new(Echo))
            .with_unavailable(
                "openai",
                LlmError::Auth { provider: "openai".into(), message: "no key".into() },
            );

        assert_eq!(set.get(None).unwrap().name(), "echo");
        assert_eq!(set.get(Some("  ")).unwrap().name(), "echo");
        assert_eq!(set.get(Some("ECHO")).unwrap().name(), "echo");
        assert!(matches!(set.get(Some("openai")), Err(LlmError::Auth { .. })));
        assert!(matches!(set.get(Some("mystery")), Err(LlmError::UnknownProvider(_))));
    }

    #[test]
    fn provider_alias_resolves_to_canonical_name() {
        let set = ProviderSet::new("echo").with_unavailable(
            "gemini",
            LlmError::Auth { provider: "gemini".into(), message: "no key".into() },
        );
        assert!(matches!(set.get(Some("google")), Err(LlmError::Auth { .. })));
        assert!(matches!(set.get(Some(" Google ")), Err(LlmError::Auth { .. })));
    }

    #[test]
    fn response_bodies() {
        let openai = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        assert_eq!(extract_openai_text(openai).unwrap(), "hi");

        let gemini = r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#;
        assert_eq!(extract_candidate_text(gemini).unwrap(), "ab");
        assert!(extract_candidate_text(r#"{"candidates":[]}"#).is_err());

        let ollama = r#"{"model":"m","message":{"role":"assistant","content":"ok"},"done":true}"#;
        assert_eq!(extract_ollama_text(ollama).unwrap(), "ok");
        assert_eq!(extract_ollama_text(r#"{"error":"model not found"}"#).unwrap_err(), "model not found");
    }

    #[test]
    fn stream_lines() {
        let sse = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(stream_chunk(ProviderKind::OpenAi, sse), Some(Ok("Hel".into())));
        assert_eq!(stream_chunk(ProviderKind::OpenAi, "data: [DONE]"), None);
        assert_eq!(stream_chunk(ProviderKind::OpenAi, ": keep-alive"), None);
        assert_eq!(
            stream_chunk(ProviderKind::OpenAi, r#"data: {"choices":[{"delta":{}}]}"#),
            None
        );

        let g = r#"data: {"candidates":[{"content":{"parts":[{"text":"lo"}]}}]}"#;
        assert_eq!(stream_chunk(ProviderKind::Gemini, g), Some(Ok("lo".into())));

        let o = r#"{"message":{"content":"!"},"done":false}"#;
        assert_eq!(stream_chunk(ProviderKind::Ollama, o), Some(Ok("!".into())));
    }

    #[test]
    fn gemini_frames_without_text_are_skipped() {
        let finish = r#"data: {"candidates":[{"content":{"role":"model"},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":12,"totalTokenCount":40}}"#;
        assert_eq!(stream_chunk(ProviderKind::Gemini, finish), None);

        let usage = r#"data: {"usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":28}}"#;
        assert_eq!(stream_chunk(ProviderKind::Gemini, usage), None);

        let error = r#"data: {"error":{"code":429,"message":"quota exceeded"}}"#;
        assert_eq!(
            stream_chunk(ProviderKind::Gemini, error),
            Some(Err("quota exceeded".into()))
        );

        // whole-body extraction stays strict
        assert!(extract_candidate_text(r#"{"candidates":[{"content":{"role":"model"}}]}"#).is_err());
    }

    #[tokio::test]
    async fn lines_are_reassembled_across_chunks() {
        let parts: Vec<Result<Vec<u8>, LlmError>> = vec![
            Ok(b"data: a\r\nda".to_vec()),
            Ok(b"ta: b\n\n".to_vec()),
            Ok(b"tail".to_vec()),
        ];
        let lines: Vec<String> = split_lines(stream::iter(parts))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(lines, vec!["data: a", "data: b", "", "tail"]);
    }

    #[tokio::test]
    async fn default_stream_yields_whole_completion() {
        let chunks: Vec<_> = Echo.stream("sys", "hello").await.unwrap().collect().await;
        assert_eq!(chunks, vec![Ok("hello".to_string())]);
    }
}
