use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::{ProviderKind, Verdict, VisionProvider, encode_image, finish_verdict, join_url, send_json, token_count};
use crate::config::ProviderConfig;
use crate::config::constants;
use crate::cost::Usage;
use crate::error::ProviderError;

/// Google Gemini `generateContent` backend with inline image data.
pub struct GeminiProvider {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig, client: Client) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        }
    }
}

impl VisionProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/jpeg", "data": encode_image(image) } }
                ]
            }],
            "generationConfig": { "maxOutputTokens": constants::MAX_OUTPUT_TOKENS }
        });

        let request = self
            .client
            .post(join_url(&self.endpoint, &format!("models/{}:generateContent", self.model)))
            .header("x-goog-api-key", &self.api_key)
            .json(&body);

        let (response, latency_ms) = send_json(ProviderKind::Gemini, request)?;
        finish_verdict(
            ProviderKind::Gemini,
            &self.model,
            reply_text(&response),
            usage(&response),
            latency_ms,
        )
    }
}

fn reply_text(response: &Value) -> Option<String> {
    response["candidates"][0]["content"]["parts"]
        .as_array()?
        .iter()
        .find_map(|part| part["text"].as_str())
        .map(str::to_string)
}

fn usage(response: &Value) -> Option<Usage> {
    let usage = &response["usageMetadata"];
    Some(Usage {
        input_tokens: token_count(&usage["promptTokenCount"])?,
        output_tokens: token_count(&usage["candidatesTokenCount"])?,
    })
}
