//! Remote speech synthesis over HTTP.
//!
//! One POST per request with an SSML body; the response body is the audio
//! file. No retries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::VoiceConfig;
use crate::error::SynthesisError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that can turn text into encoded audio bytes.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Vec<u8>, SynthesisError>;
}

/// Escape the five XML special characters.
fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Build the SSML document sent to the API.
pub fn build_ssml(text: &str, voice: &VoiceConfig) -> String {
    let prosody = format!(
        r#"<prosody rate="{}%" pitch="{}%">{}</prosody>"#,
        voice.speed,
        voice.pitch,
        escape_xml(text)
    );
    let body = if voice.has_style() {
        format!(
            r#"<mstts:express-as style="{}">{prosody}</mstts:express-as>"#,
            escape_xml(voice.style.trim())
        )
    } else {
        prosody
    };

    format!(
        concat!(
            r#"<speak xmlns="http://www.w3.org/2001/10/synthesis" "#,
            r#"xmlns:mstts="http://www.w3.org/2001/mstts" "#,
            r#"xmlns:emo="http://www.w3.org/2009/10/emotionml" "#,
            r#"version="1.0" xml:lang="{}">"#,
            r#"<voice name="{}">{}</voice></speak>"#
        ),
        escape_xml(&voice.language),
        escape_xml(&voice.voice),
        body
    )
}

pub struct HttpSynthesizer {
    client: Client,
}

impl HttpSynthesizer {
    pub fn new() -> Result<Self, SynthesisError> {
        Self::with_builder(Client::builder())
    }

    fn with_builder(builder: reqwest::ClientBuilder) -> Result<Self, SynthesisError> {
        let client = builder.timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Vec<u8>, SynthesisError> {
        let url = voice.full_api_url();
        let ssml = build_ssml(text, voice);
        debug!("POST {url} ({} bytes of SSML)", ssml.len());

        let resp = self
            .client
            .post(&url)
            .header("Output-Format", &voice.output_format)
            .header(reqwest::header::CONTENT_TYPE, "application/ssml+xml")
            .header(voice.api_key_header.as_str(), &voice.api_key)
            .header("Voice-Variant", voice.voice.to_lowercase())
            .body(ssml)
            .send()
            .await
            .inspect_err(|e| {
                if e.is_connect() {
                    warn!("Cannot connect to synthesis API at {url}");
                } else if e.is_timeout() {
                    warn!("Synthesis request timed out after {}s", REQUEST_TIMEOUT.as_secs());
                }
            })?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(SynthesisError::EmptyBody);
        }
        debug!("Received {} bytes of audio", bytes.len());
        Ok(bytes.to_vec())
    }
}
