//! AI vision backends behind one contract.
//!
//! Every backend implements [`VisionProvider`]: encode the frame the way the
//! backend wants it, send the prompt, turn the reply into a strict OK/FAIL
//! [`Verdict`], price the call and time it. [`create_provider`] is the only
//! place that knows which concrete type serves which [`ProviderKind`].

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::config::constants;
use crate::cost::{self, Usage};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::snapshot::SnapshotRef;

mod anthropic;
mod azure;
mod gemini;
mod ollama;
mod openai;

pub use anthropic::AnthropicProvider;
pub use azure::AzureOpenAiProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Prompt used by the connectivity probe.
pub const PROBE_PROMPT: &str = "Respond with: VERDICT: OK";

/// The supported vision backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure_openai")]
    AzureOpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "xai")]
    Xai,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "ollama")]
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::OpenAi,
        ProviderKind::AzureOpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Xai,
        ProviderKind::Gemini,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::AzureOpenAi => "azure_openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Xai => "xai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::AzureOpenAi => constants::DEFAULT_AZURE_DEPLOYMENT,
            ProviderKind::Anthropic => "claude-sonnet-4-20250514",
            ProviderKind::Xai => "grok-2-vision-latest",
            ProviderKind::Gemini => "gemini-2.0-flash",
            ProviderKind::Ollama => "llava",
        }
    }

    /// Base API URL. Azure has no public default; the resource URL must be configured.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::AzureOpenAi => "",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Xai => "https://api.x.ai/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }

    fn timeout(&self) -> Duration {
        match self {
            ProviderKind::Ollama => Duration::from_secs(constants::OLLAMA_TIMEOUT_SECONDS),
            _ => Duration::from_secs(constants::PROVIDER_TIMEOUT_SECONDS),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown vision provider; expected one of {}",
                    ProviderKind::ALL.map(|k| k.as_str()).join(", ")
                )
            })
    }
}

/// A normalized OK/FAIL judgment for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub failed: bool,
    pub reason: String,
    /// Model-reported confidence in `[0, 1]`, when the reply carried one.
    pub confidence: Option<f32>,
    pub provider: ProviderKind,
    pub model: String,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub raw_snapshot_reference: Option<SnapshotRef>,
}

/// The uniform contract every vision backend implements.
///
/// The provider's [`ProviderConfig`] is bound when the adapter is built by
/// [`create_provider`], so each call only carries the frame and the prompt.
pub trait VisionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    /// Judge one JPEG frame.
    ///
    /// # Errors
    ///
    /// Returns a `ProviderError` whose kind tells auth, throttling, network
    /// and unsupported-model failures apart. A reply that does not carry a
    /// clear OK/FAIL verdict is `MalformedResponse`, never a guess.
    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError>;

    /// Minimal round-trip used by the operator-facing connectivity check.
    ///
    /// The default sends a generated 1x1 JPEG with [`PROBE_PROMPT`].
    fn test_connection(&self) -> (bool, String) {
        let image = match probe_image() {
            Ok(image) => image,
            Err(e) => return (false, format!("{} error: {}", self.kind(), e)),
        };
        match self.analyze(&image, PROBE_PROMPT) {
            Ok(verdict) => (
                true,
                format!(
                    "Connected to {}/{} ({}ms)",
                    self.kind(),
                    self.model(),
                    verdict.latency_ms
                ),
            ),
            Err(e) if e.kind == ProviderErrorKind::MalformedResponse => (
                true,
                format!(
                    "Connected to {}/{}, but the reply did not follow the verdict format",
                    self.kind(),
                    self.model()
                ),
            ),
            Err(e) => (false, format!("{} error: {}", self.kind(), truncate(&e.message, 200))),
        }
    }
}

/// Build the adapter for `config.kind`.
///
/// # Errors
///
/// Returns a `Network` error if the HTTP client cannot be initialised.
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn VisionProvider>, ProviderError> {
    let client = http_client(config.kind)?;
    let provider: Box<dyn VisionProvider> = match config.kind {
        ProviderKind::OpenAi | ProviderKind::Xai => Box::new(OpenAiProvider::new(config, client)),
        ProviderKind::AzureOpenAi => Box::new(AzureOpenAiProvider::new(config, client)),
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(config, client)),
        ProviderKind::Gemini => Box::new(GeminiProvider::new(config, client)),
        ProviderKind::Ollama => Box::new(OllamaProvider::new(config, client)),
    };
    debug!("Created {} vision provider for model {}", config.kind, config.model);
    Ok(provider)
}

fn http_client(kind: ProviderKind) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(kind.timeout())
        .build()
        .map_err(|e| ProviderError::new(ProviderErrorKind::Network, kind.as_str(), e.to_string()))
}

/// Result of parsing a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedVerdict {
    pub failed: bool,
    pub reason: String,
    pub confidence: Option<f32>,
}

/// Parse `VERDICT: OK` or `VERDICT: FAIL | reason` out of a model reply.
///
/// Markers are matched case-insensitively anywhere in the reply. Any FAIL
/// marker outranks OK markers, and the last FAIL wins since earlier ones are
/// usually the model echoing the answer format. Returns `None` when no
/// verdict marker is present.
pub fn parse_verdict(reply: &str) -> Option<ParsedVerdict> {
    let markers = verdict_markers(reply);
    let (failed, word_end) = markers
        .iter()
        .rev()
        .find(|(failed, _)| *failed)
        .or_else(|| markers.first())
        .copied()?;

    let after = reply[word_end..].trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let line = after.lines().next().unwrap_or("");
    let reason = line
        .trim()
        .trim_start_matches(['|', ':', '-'])
        .trim()
        .to_string();
    let reason = if !reason.is_empty() {
        reason
    } else if failed {
        "visual failure detected".to_string()
    } else {
        "print looks normal".to_string()
    };

    Some(ParsedVerdict {
        failed,
        reason,
        confidence: parse_confidence(reply),
    })
}

/// Every `VERDICT: OK|FAIL` marker in order, as (failed, byte offset past the word).
fn verdict_markers(reply: &str) -> Vec<(bool, usize)> {
    // ASCII uppercasing keeps byte offsets aligned with `reply`.
    let upper = reply.to_ascii_uppercase();
    let mut markers = Vec::new();
    let mut search_from = 0;

    while let Some(found) = upper[search_from..].find("VERDICT") {
        let marker_end = search_from + found + "VERDICT".len();
        search_from = marker_end;

        let rest = &upper[marker_end..];
        let trimmed = rest.trim_start();
        let trimmed = trimmed.strip_prefix(':').unwrap_or(trimmed).trim_start();
        let offset = marker_end + (rest.len() - trimmed.len());

        if trimmed.starts_with("FAIL") {
            markers.push((true, offset + "FAIL".len()));
        } else if trimmed.starts_with("OK") {
            markers.push((false, offset + "OK".len()));
        }
    }
    markers
}

/// Find an optional `confidence: 0.9` or `confidence: 90%` token.
fn parse_confidence(reply: &str) -> Option<f32> {
    let lower = reply.to_ascii_lowercase();
    let start = lower.find("confidence")? + "confidence".len();
    let rest = lower[start..].trim_start_matches([' ', ':', '=', '\t']);
    let number: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f32 = number.parse().ok()?;
    let percent = rest[number.len()..].trim_start().starts_with('%');
    let value = if percent || value > 1.0 { value / 100.0 } else { value };
    (0.0..=1.0).contains(&value).then_some(value)
}

/// Send a JSON request and return the decoded body and the elapsed time.
pub(crate) fn send_json(kind: ProviderKind, request: RequestBuilder) -> Result<(Value, u64), ProviderError> {
    let started = Instant::now();
    let response = request
        .send()
        .map_err(|e| ProviderError::from_transport(kind.as_str(), &e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(ProviderError::from_status(kind.as_str(), status.as_u16(), &body));
    }

    let body: Value = response
        .json()
        .map_err(|e| ProviderError::malformed(kind.as_str(), format!("response is not JSON: {}", e)))?;
    let latency_ms = started.elapsed().as_millis() as u64;
    Ok((body, latency_ms))
}

/// Turn the reply text into a priced verdict.
pub(crate) fn finish_verdict(
    kind: ProviderKind,
    model: &str,
    reply: Option<String>,
    usage: Option<Usage>,
    latency_ms: u64,
) -> Result<Verdict, ProviderError> {
    let reply = reply
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ProviderError::malformed(kind.as_str(), "response carried no text"))?;

    let parsed = parse_verdict(&reply).ok_or_else(|| {
        warn!("{} reply did not contain a verdict: {}", kind, truncate(&reply, 200));
        ProviderError::malformed(
            kind.as_str(),
            format!("no verdict in reply: {}", truncate(&reply, 200)),
        )
    })?;

    Ok(Verdict {
        failed: parsed.failed,
        reason: parsed.reason,
        confidence: parsed.confidence,
        provider: kind,
        model: model.to_string(),
        latency_ms,
        cost_usd: cost::call_cost(kind, model, usage),
        raw_snapshot_reference: None,
    })
}

pub(crate) fn encode_image(image: &[u8]) -> String {
    STANDARD.encode(image)
}

pub(crate) fn join_url(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Read a token count that providers report as a JSON number.
pub(crate) fn token_count(value: &Value) -> Option<u64> {
    value.as_u64()
}

/// Generate the 1x1 JPEG sent by the connectivity probe.
pub fn probe_image() -> Result<Vec<u8>, image::ImageError> {
    let pixel = image::RgbImage::from_pixel(1, 1, image::Rgb([255, 0, 0]));
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(pixel)
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Jpeg)?;
    Ok(buffer)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
