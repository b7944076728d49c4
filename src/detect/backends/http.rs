//! Hosted inference API backend.
//!
//! Frames are JPEG-encoded, base64'd and POSTed as a form body to
//! `{api_url}/{model_id}`. The service answers with a JSON object holding a
//! `predictions` array in either of the shapes `RawPrediction` accepts.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;
use url::Url;

use crate::config::DetectorSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, RawPrediction};
use crate::error::{DetectError, StartupError};

const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub api_url: String,
    pub api_key: String,
    pub model_id: String,
    pub confidence_threshold: f32,
    pub timeout: Duration,
    pub jpeg_quality: u8,
}

impl HttpConfig {
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self, StartupError> {
        let missing = |key: &str| StartupError::Config(format!("detector.{} is required for http", key));
        Ok(Self {
            api_url: settings.api_url.clone().ok_or_else(|| missing("api_url"))?,
            api_key: settings.api_key.clone().ok_or_else(|| missing("api_key"))?,
            model_id: settings.model_id.clone().ok_or_else(|| missing("model_id"))?,
            confidence_threshold: settings.confidence_threshold,
            timeout: settings.timeout,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    predictions: Vec<RawPrediction>,
}

pub struct HttpBackend {
    agent: ureq::Agent,
    endpoint: Url,
    timeout: Duration,
    jpeg_quality: u8,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let endpoint = build_endpoint(&config)?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout(config.timeout)
            .build();
        Ok(Self {
            agent,
            endpoint,
            timeout: config.timeout,
            jpeg_quality: config.jpeg_quality,
        })
    }

    fn encode_frame(&self, image: &RgbImage) -> Result<String> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(image)
            .context("encode frame as jpeg")?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }

    fn classify(&self, err: ureq::Error) -> DetectError {
        match err {
            ureq::Error::Status(code, _) => DetectError::Failed(format!("http status {}", code)),
            ureq::Error::Transport(transport) => {
                if is_timeout(&transport) {
                    DetectError::Timeout(self.timeout)
                } else {
                    DetectError::failed(transport)
                }
            }
        }
    }
}

impl DetectorBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        let body = self.encode_frame(image).map_err(DetectError::failed)?;
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/x-www-form-urlencoded")
            .send_string(&body)
            .map_err(|e| self.classify(e))?;
        let parsed: InferResponse = response.into_json().map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
                DetectError::Timeout(self.timeout)
            } else {
                DetectError::Failed(format!("invalid detector response: {}", e))
            }
        })?;
        Ok(parsed
            .predictions
            .into_iter()
            .map(RawPrediction::normalize)
            .collect())
    }
}

fn build_endpoint(config: &HttpConfig) -> Result<Url> {
    let base = config.api_url.trim_end_matches('/');
    let model = config.model_id.trim_matches('/');
    if model.is_empty() {
        return Err(anyhow!("model id must not be empty"));
    }
    let mut url = Url::parse(&format!("{}/{}", base, model))
        .with_context(|| format!("invalid detector url '{}'", config.api_url))?;
    let confidence_pct = (config.confidence_threshold.clamp(0.0, 1.0) * 100.0).round() as u32;
    url.query_pairs_mut()
        .append_pair("api_key", &config.api_key)
        .append_pair("confidence", &confidence_pct.to_string())
        .append_pair("format", "json");
    Ok(url)
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(transport);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        source = err.source();
    }
    transport.to_string().contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: &str) -> HttpConfig {
        HttpConfig {
            api_url: api_url.to_string(),
            api_key: "secret".to_string(),
            model_id: "motos/1".to_string(),
            confidence_threshold: 0.4,
            timeout: Duration::from_secs(1),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    #[test]
    fn endpoint_includes_model_and_query() {
        let url = build_endpoint(&config("https://detect.example.com/")).unwrap();
        assert_eq!(url.path(), "/motos/1");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("api_key".to_string(), "secret".to_string())));
        assert!(pairs.contains(&("confidence".to_string(), "40".to_string())));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(build_endpoint(&config("not a url")).is_err());
    }
}
