//! Minimal client for the Gemini `generateContent` API.

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-pro";
/// Environment variable the binary reads the key from.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Error)]
pub enum GenAiError {
    #[error("API key is empty; set GEMINI_API_KEY")]
    MissingApiKey,
    #[error("API error {code} ({status}): {message}")]
    Api {
        code: u16,
        status: String,
        message: String,
    },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Body(#[from] std::io::Error),
    #[error("response has no candidates (block reason: {})", .0.as_deref().unwrap_or("none"))]
    Blocked(Option<String>),
}

/// Sampling parameters. Unset fields use the model defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn user_text(text: &str) -> Self {
        Self {
            role: Some("user".into()),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }

    /// Concatenated text of all parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<&'a GenerationConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

impl GenerateContentResponse {
    /// Text of the first candidate.
    pub fn text(&self) -> Option<String> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(Content::text)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Map an HTTP error status and body to `GenAiError::Api`.
fn api_error(http_status: u16, body: &str) -> GenAiError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => GenAiError::Api {
            code: if parsed.error.code == 0 { http_status } else { parsed.error.code },
            status: parsed.error.status,
            message: parsed.error.message,
        },
        Err(_) => GenAiError::Api {
            code: http_status,
            status: String::new(),
            message: body.trim().to_string(),
        },
    }
}

/// Fail when the API returned no candidates at all.
fn check_candidates(response: GenerateContentResponse) -> Result<GenerateContentResponse, GenAiError> {
    if response.candidates.is_empty() {
        let reason = response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.clone());
        return Err(GenAiError::Blocked(reason));
    }
    Ok(response)
}

/// A model handle bound to one API key.
#[derive(Debug, Clone)]
pub struct GenerativeModel {
    api_key: String,
    model: String,
    endpoint: String,
    pub generation_config: Option<GenerationConfig>,
}

impl GenerativeModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, GenAiError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GenAiError::MissingApiKey);
        }
        Ok(Self {
            api_key,
            model: model.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            generation_config: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = Some(config);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `models/<name>` unless the name already carries a prefix.
    fn model_path(&self) -> String {
        if self.model.contains('/') {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    pub fn url(&self) -> String {
        format!(
            "{}/v1beta/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model_path()
        )
    }

    /// Send one prompt and wait for the full response. Blocking.
    pub fn generate_content(&self, prompt: &str) -> Result<GenerateContentResponse, GenAiError> {
        let request = GenerateContentRequest {
            contents: vec![Content::user_text(prompt)],
            generation_config: self.generation_config.as_ref(),
        };
        let url = self.url();
        debug!("POST {url}");

        let response = match ureq::post(&url)
            .set("x-goog-api-key", &self.api_key)
            .send_json(&request)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(api_error(code, &body));
            }
            Err(e) => return Err(GenAiError::Transport(e.to_string())),
        };

        check_candidates(response.into_json()?)
    }
}
