use serde::Deserialize;
use serde_json::{Map, Value};

/// The object the model is asked to emit. `changes` is still untrusted here.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LlmPatchResponse {
    pub changes: Map<String, Value>,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFormatError {
    pub message: String,
    pub raw: String,
}

impl std::fmt::Display for ResponseFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LLM response is not the expected JSON object: {}", self.message)
    }
}

impl std::error::Error for ResponseFormatError {}

/// Removes a leading ```` ```lang ```` line and a trailing ```` ``` ```` if the text
/// starts with a fence. Anything else is returned trimmed.
pub fn strip_code_fence(text: &str) -> &str {
    let t = text.trim();
    if !t.starts_with("```") {
        return t;
    }
    let body = match t.find('\n') {
        Some(nl) => &t[nl + 1..],
        None => t.trim_start_matches('`'),
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse_llm_response(raw: &str) -> Result<LlmPatchResponse, ResponseFormatError> {
    let stripped = strip_code_fence(raw);

    let first_err = match serde_json::from_str::<LlmPatchResponse>(stripped) {
        Ok(parsed) => return Ok(parsed),
        Err(e) => e,
    };

    // Chatty models sometimes wrap the object in prose.
    if let Some(inner) = outermost_object(stripped) {
        if inner.len() != stripped.len() {
            if let Ok(parsed) = serde_json::from_str::<LlmPatchResponse>(inner) {
                return Ok(parsed);
            }
        }
    }

    Err(ResponseFormatError {
        message: first_err.to_string(),
        raw: raw.to_string(),
    })
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
