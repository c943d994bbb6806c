use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::{ProviderKind, Verdict, VisionProvider, encode_image, finish_verdict, join_url, send_json, token_count};
use crate::config::ProviderConfig;
use crate::config::constants;
use crate::cost::Usage;
use crate::error::ProviderError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API backend.
pub struct AnthropicProvider {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig, client: Client) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        }
    }
}

impl VisionProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError> {
        let body = json!({
            "model": self.model,
            "max_tokens": constants::MAX_OUTPUT_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/jpeg",
                            "data": encode_image(image),
                        }
                    },
                    { "type": "text", "text": prompt }
                ]
            }]
        });

        let request = self
            .client
            .post(join_url(&self.endpoint, "messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let (response, latency_ms) = send_json(ProviderKind::Anthropic, request)?;
        finish_verdict(
            ProviderKind::Anthropic,
            &self.model,
            reply_text(&response),
            usage(&response),
            latency_ms,
        )
    }
}

fn reply_text(response: &Value) -> Option<String> {
    response["content"]
        .as_array()?
        .iter()
        .find(|block| block["type"] == "text")
        .and_then(|block| block["text"].as_str())
        .map(str::to_string)
}

fn usage(response: &Value) -> Option<Usage> {
    let usage = &response["usage"];
    Some(Usage {
        input_tokens: token_count(&usage["input_tokens"])?,
        output_tokens: token_count(&usage["output_tokens"])?,
    })
}
