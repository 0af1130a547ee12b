use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use url::Url;

use crate::detect::backend::TextRecognizer;
use crate::detect::result::TextReading;

/// OCR service client.
///
/// Posts each plate crop as `image/jpeg` and expects a JSON array of
/// `{"text": .., "confidence": ..}` back. Any HTTP or decode failure is an
/// error for that frame only.
pub struct HttpRecognizer {
    agent: ureq::Agent,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct ReadingBody {
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl HttpRecognizer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("parse OCR endpoint url")?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported OCR endpoint scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, endpoint })
    }
}

impl TextRecognizer for HttpRecognizer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn recognize(&mut self, region: &RgbImage) -> Result<Vec<TextReading>> {
        let mut jpeg = Cursor::new(Vec::new());
        region
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .context("encode plate crop")?;
        let body: Vec<ReadingBody> = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "image/jpeg")
            .send_bytes(jpeg.get_ref())
            .with_context(|| format!("OCR request to {}", self.endpoint))?
            .into_json()
            .context("decode OCR response")?;
        Ok(body
            .into_iter()
            .map(|reading| TextReading::new(reading.text, reading.confidence))
            .collect())
    }
}
