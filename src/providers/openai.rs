use reqwest::blocking::Client;
use serde_json::{Value, json};

use super::{ProviderKind, Verdict, VisionProvider, encode_image, finish_verdict, join_url, send_json, token_count};
use crate::config::ProviderConfig;
use crate::config::constants;
use crate::cost::Usage;
use crate::error::ProviderError;

/// OpenAI chat-completions backend.
///
/// xAI (Grok) speaks the same wire format, so one adapter serves both;
/// only the endpoint and the pricing key differ.
pub struct OpenAiProvider {
    kind: ProviderKind,
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig, client: Client) -> Self {
        Self {
            kind: config.kind,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        }
    }
}

impl VisionProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError> {
        let body = chat_completion_body(Some(&self.model), prompt, &encode_image(image));
        let request = self
            .client
            .post(join_url(&self.endpoint, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body);

        let (response, latency_ms) = send_json(self.kind, request)?;
        finish_verdict(
            self.kind,
            &self.model,
            chat_completion_reply(&response),
            chat_completion_usage(&response),
            latency_ms,
        )
    }
}

/// Request body shared by OpenAI, xAI and Azure. Azure selects the model
/// through the deployment URL, so `model` is omitted there.
pub(super) fn chat_completion_body(model: Option<&str>, prompt: &str, image_b64: &str) -> Value {
    let mut body = json!({
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{}", image_b64) }
                }
            ]
        }],
        "max_tokens": constants::MAX_OUTPUT_TOKENS,
    });
    if let Some(model) = model {
        body["model"] = json!(model);
    }
    body
}

pub(super) fn chat_completion_reply(response: &Value) -> Option<String> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
}

pub(super) fn chat_completion_usage(response: &Value) -> Option<Usage> {
    let usage = &response["usage"];
    Some(Usage {
        input_tokens: token_count(&usage["prompt_tokens"])?,
        output_tokens: token_count(&usage["completion_tokens"])?,
    })
}
