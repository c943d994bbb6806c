use reqwest::blocking::Client;

use super::openai::{chat_completion_body, chat_completion_reply, chat_completion_usage};
use super::{ProviderKind, Verdict, VisionProvider, encode_image, finish_verdict, join_url, send_json};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// Azure OpenAI backend, addressed by resource endpoint + deployment.
pub struct AzureOpenAiProvider {
    endpoint: String,
    api_key: String,
    deployment: String,
    api_version: String,
    model: String,
    client: Client,
}

impl AzureOpenAiProvider {
    pub fn new(config: &ProviderConfig, client: Client) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            deployment: config.azure_deployment.clone(),
            api_version: config.azure_api_version.clone(),
            model: config.model.clone(),
            client,
        }
    }

    fn url(&self) -> String {
        join_url(
            &self.endpoint,
            &format!(
                "openai/deployments/{}/chat/completions?api-version={}",
                self.deployment, self.api_version
            ),
        )
    }
}

impl VisionProvider for AzureOpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureOpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError> {
        let body = chat_completion_body(None, prompt, &encode_image(image));
        let request = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .json(&body);

        let (response, latency_ms) = send_json(ProviderKind::AzureOpenAi, request)?;
        finish_verdict(
            ProviderKind::AzureOpenAi,
            &self.model,
            chat_completion_reply(&response),
            chat_completion_usage(&response),
            latency_ms,
        )
    }
}
