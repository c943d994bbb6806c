use log::debug;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::{ProviderKind, Verdict, VisionProvider, encode_image, finish_verdict, join_url, send_json, token_count};
use crate::config::ProviderConfig;
use crate::config::constants;
use crate::cost::Usage;
use crate::error::{ProviderError, ProviderErrorKind};

/// Local Ollama backend. Runs entirely on the operator's hardware, so every
/// verdict is free.
pub struct OllamaProvider {
    endpoint: String,
    model: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig, client: Client) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            client,
        }
    }

    /// Names of the models installed on the Ollama server.
    pub fn installed_models(&self) -> Result<Vec<String>, ProviderError> {
        let request = self.client.get(join_url(&self.endpoint, "api/tags"));
        let (response, _) = send_json(ProviderKind::Ollama, request)?;
        Ok(model_names(&response))
    }
}

impl VisionProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": prompt,
                "images": [encode_image(image)],
            }],
            "stream": false,
            "options": { "num_predict": constants::MAX_OUTPUT_TOKENS }
        });

        let request = self.client.post(join_url(&self.endpoint, "api/chat")).json(&body);
        let (response, latency_ms) = send_json(ProviderKind::Ollama, request)?;

        let usage = match (
            token_count(&response["prompt_eval_count"]),
            token_count(&response["eval_count"]),
        ) {
            (Some(input_tokens), Some(output_tokens)) => Some(Usage {
                input_tokens,
                output_tokens,
            }),
            _ => None,
        };

        finish_verdict(
            ProviderKind::Ollama,
            &self.model,
            response["message"]["content"].as_str().map(str::to_string),
            usage,
            latency_ms,
        )
    }

    /// Check the server is up and the configured model is installed,
    /// without running an analysis.
    fn test_connection(&self) -> (bool, String) {
        match self.installed_models() {
            Ok(models) => {
                debug!("Ollama models installed: {}", models.join(", "));
                // Installed names usually carry a tag such as `:latest`.
                if models.iter().any(|name| name.contains(&self.model)) {
                    (true, format!("Ollama running, model '{}' available", self.model))
                } else {
                    let available: Vec<&str> = models.iter().take(5).map(String::as_str).collect();
                    (
                        false,
                        format!(
                            "Ollama running but model '{}' not found. Available: {}",
                            self.model,
                            available.join(", ")
                        ),
                    )
                }
            }
            Err(e) if e.kind == ProviderErrorKind::Network => (
                false,
                format!("Cannot connect to Ollama at {}. Is it running? ({})", self.endpoint, e.message),
            ),
            Err(e) => (false, format!("Ollama error: {}", e.message)),
        }
    }
}

fn model_names(response: &Value) -> Vec<String> {
    response["models"]
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
