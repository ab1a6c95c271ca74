use std::time::Duration;

use serde_json::json;

use crate::config::OracleConfig;
use crate::error::DigitizeError;

use super::OracleFailure;

/// Default endpoint when the configuration names none.
const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

// ── Provider trait ────────────────────────────────────────────────────────

/// One wire dialect of the vision-model service. A provider turns an image
/// plus an instruction into the model's raw text reply; everything else
/// (JSON repair, normalization, caching) lives in the adapter, so each
/// provider stays a thin encoding of its particular API.
pub trait OracleProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Issue one bounded request. The timeout covers connect + read.
    fn request(&self, png_b64: &str, prompt: &str, timeout: Duration)
        -> Result<String, OracleFailure>;
}

/// Registry: map the configured provider key to a concrete dialect.
pub fn build_provider(cfg: &OracleConfig) -> Result<Box<dyn OracleProvider>, DigitizeError> {
    if cfg.model.is_empty() {
        return Err(DigitizeError::InvalidOracleConfig("model must be set".into()));
    }
    let endpoint = cfg
        .endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    match cfg.provider.as_str() {
        "chat" | "openai" | "openai-chat" => Ok(Box::new(ChatProvider {
            endpoint,
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
        })),
        "reasoning" | "responses" => Ok(Box::new(ReasoningProvider {
            endpoint,
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            effort: cfg.reasoning_effort.clone().unwrap_or_else(|| "medium".to_string()),
        })),
        other => Err(DigitizeError::UnknownProvider(other.to_string())),
    }
}

fn classify_transport(err: ureq::Error) -> OracleFailure {
    match err {
        ureq::Error::Status(code, _) => OracleFailure::Status(code),
        ureq::Error::Transport(t) => {
            let text = t.to_string();
            if text.contains("timed out") || text.contains("timeout") {
                OracleFailure::Timeout
            } else {
                OracleFailure::Transport(text)
            }
        }
    }
}

fn agent_with_timeout(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeout.min(Duration::from_secs(10)))
        .timeout(timeout)
        .build()
}

// ── Chat dialect ──────────────────────────────────────────────────────────

/// Plain chat-completions dialect: one user message carrying the prompt
/// text and the page as a data-URL image part.
pub struct ChatProvider {
    endpoint: String,
    model: String,
    api_key: String,
}

impl OracleProvider for ChatProvider {
    fn name(&self) -> &str {
        "chat"
    }

    fn request(
        &self,
        png_b64: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, OracleFailure> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url",
                      "image_url": { "url": format!("data:image/png;base64,{png_b64}") } },
                ],
            }],
        });

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let response = agent_with_timeout(timeout)
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(body)
            .map_err(classify_transport)?;

        let value: serde_json::Value = response
            .into_json()
            .map_err(|e| OracleFailure::Malformed(e.to_string()))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OracleFailure::Malformed("no message content in reply".into()))
    }
}

// ── Reasoning dialect ─────────────────────────────────────────────────────

/// Responses-API dialect with a reasoning-effort knob. The reply arrives
/// as an output array whose message item carries the text.
pub struct ReasoningProvider {
    endpoint: String,
    model: String,
    api_key: String,
    effort: String,
}

impl OracleProvider for ReasoningProvider {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn request(
        &self,
        png_b64: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, OracleFailure> {
        let body = json!({
            "model": self.model,
            "reasoning": { "effort": self.effort },
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_text", "text": prompt },
                    { "type": "input_image",
                      "image_url": format!("data:image/png;base64,{png_b64}") },
                ],
            }],
        });

        let url = format!("{}/responses", self.endpoint.trim_end_matches('/'));
        let response = agent_with_timeout(timeout)
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(body)
            .map_err(classify_transport)?;

        let value: serde_json::Value = response
            .into_json()
            .map_err(|e| OracleFailure::Malformed(e.to_string()))?;

        // The output array mixes reasoning traces and the final message;
        // take the first message item's text part.
        let outputs = value["output"].as_array().cloned().unwrap_or_default();
        for item in outputs {
            if item["type"] == "message" {
                if let Some(parts) = item["content"].as_array() {
                    for part in parts {
                        if let Some(text) = part["text"].as_str() {
                            return Ok(text.to_string());
                        }
                    }
                }
            }
        }
        Err(OracleFailure::Malformed("no message item in output".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;

    fn cfg(provider: &str) -> OracleConfig {
        OracleConfig {
            provider: provider.to_string(),
            endpoint: None,
            model: "test-model".to_string(),
            api_key: String::new(),
            timeout_ms: 1000,
            reasoning_effort: None,
        }
    }

    #[test]
    fn registry_resolves_known_dialects() {
        assert_eq!(build_provider(&cfg("chat")).unwrap().name(), "chat");
        assert_eq!(build_provider(&cfg("openai")).unwrap().name(), "chat");
        assert_eq!(build_provider(&cfg("reasoning")).unwrap().name(), "reasoning");
    }

    #[test]
    fn registry_rejects_unknown_provider() {
        assert!(matches!(
            build_provider(&cfg("carrier-pigeon")),
            Err(DigitizeError::UnknownProvider(_))
        ));
    }

    #[test]
    fn registry_rejects_empty_model() {
        let mut c = cfg("chat");
        c.model = String::new();
        assert!(matches!(build_provider(&c), Err(DigitizeError::InvalidOracleConfig(_))));
    }
}
