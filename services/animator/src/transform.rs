//! Client for the generative image edit API.
//!
//! Inputs are normalized to PNG and sent with a fully transparent mask, so the
//! model restyles the whole frame. The canvas size is picked from the input's
//! aspect ratio (see [`crate::dimensions`]).

use crate::config::TransformConfig;
use crate::dimensions::{select_canvas, SizeDecision};
use crate::storage::{extension_for_content_type, Blob};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::io::Cursor;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Content types the edit endpoint accepts
const SUPPORTED_INPUT_EXTENSIONS: [&str; 3] = ["jpg", "png", "webp"];

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Input is {size} bytes, maximum is {max}")]
    InputTooLarge { size: usize, max: usize },

    #[error("Unsupported input type {0}")]
    UnsupportedType(String),

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Image API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Image API returned no image")]
    EmptyResponse,

    #[error("Invalid image payload: {0}")]
    Payload(String),
}

/// Turns an input photo into its stylized rendition
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageTransformer: Send + Sync {
    async fn transform(&self, input: &Blob) -> Result<Blob, TransformError>;
}

/// Request body parts derived from an input image
#[derive(Debug)]
pub struct PreparedEdit {
    pub image_png: Vec<u8>,
    pub mask_png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub size: SizeDecision,
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, TransformError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// Validate an input and build the PNG image, transparent mask and canvas size
pub fn prepare_edit(input: &Blob, max_input_bytes: usize) -> Result<PreparedEdit, TransformError> {
    if input.bytes.len() > max_input_bytes {
        return Err(TransformError::InputTooLarge {
            size: input.bytes.len(),
            max: max_input_bytes,
        });
    }

    match extension_for_content_type(&input.content_type) {
        Some(ext) if SUPPORTED_INPUT_EXTENSIONS.contains(&ext) => {}
        _ => return Err(TransformError::UnsupportedType(input.content_type.clone())),
    }

    let decoded = image::load_from_memory(&input.bytes)?;
    let (width, height) = (decoded.width(), decoded.height());

    let image_png = encode_png(&decoded)?;
    let mask = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    let mask_png = encode_png(&DynamicImage::ImageRgba8(mask))?;

    Ok(PreparedEdit {
        image_png,
        mask_png,
        width,
        height,
        size: select_canvas(width, height),
    })
}

/// Sniff the content type of returned bytes
fn image_content_type(bytes: &[u8]) -> Result<&'static str, TransformError> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => Ok("image/png"),
        Ok(ImageFormat::Jpeg) => Ok("image/jpeg"),
        Ok(ImageFormat::WebP) => Ok("image/webp"),
        Ok(other) => Err(TransformError::Payload(format!("unexpected format {:?}", other))),
        Err(e) => Err(TransformError::Payload(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    #[serde(default)]
    data: Vec<EditResult>,
}

#[derive(Debug, Deserialize)]
struct EditResult {
    b64_json: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI-compatible `/images/edits` client
pub struct OpenAiTransformer {
    http: reqwest::Client,
    config: TransformConfig,
}

impl OpenAiTransformer {
    pub fn new(config: &TransformConfig) -> Result<Self, TransformError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!(
            api_base = %config.api_base,
            model = %config.model,
            "Image transformer initialized"
        );

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn edits_url(&self) -> String {
        format!("{}/images/edits", self.config.api_base.trim_end_matches('/'))
    }

    async fn download(&self, url: &str) -> Result<Blob, TransformError> {
        let response = self.http.get(url).send().await?.error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(TransformError::Payload(format!(
                "result URL served {:?}, expected an image",
                content_type
            )));
        }

        let bytes = response.bytes().await?.to_vec();
        Ok(Blob::new(bytes, content_type))
    }
}

#[async_trait]
impl ImageTransformer for OpenAiTransformer {
    #[instrument(skip(self, input), fields(input_bytes = input.bytes.len()))]
    async fn transform(&self, input: &Blob) -> Result<Blob, TransformError> {
        let prepared = prepare_edit(input, self.config.max_input_bytes)?;
        debug!(
            width = prepared.width,
            height = prepared.height,
            size = %prepared.size.size,
            "Prepared edit request"
        );

        let form = Form::new()
            .text("model", self.config.model.clone())
            .text("prompt", self.config.prompt.clone())
            .text("n", "1")
            .text("size", prepared.size.size.as_str())
            .part(
                "image",
                Part::bytes(prepared.image_png)
                    .file_name("image.png")
                    .mime_str("image/png")?,
            )
            .part(
                "mask",
                Part::bytes(prepared.mask_png)
                    .file_name("mask.png")
                    .mime_str("image/png")?,
            );

        let started = Instant::now();
        let response = self
            .http
            .post(self.edits_url())
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            warn!(status = status.as_u16(), %message, "Image API rejected edit request");
            return Err(TransformError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: EditResponse = response.json().await?;
        let result = body
            .data
            .into_iter()
            .next()
            .ok_or(TransformError::EmptyResponse)?;

        let blob = match (result.b64_json, result.url) {
            (Some(encoded), _) => {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| TransformError::Payload(e.to_string()))?;
                let content_type = image_content_type(&bytes)?;
                Blob::new(bytes, content_type)
            }
            (None, Some(url)) => self.download(&url).await?,
            (None, None) => return Err(TransformError::EmptyResponse),
        };

        metrics::histogram!("animator.transform.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            output_bytes = blob.bytes.len(),
            content_type = %blob.content_type,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image transformed"
        );

        Ok(blob)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dimensions::CanvasSize;

    pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 120, 40, 255]));
        encode_png(&DynamicImage::ImageRgba8(img)).unwrap()
    }

    #[test]
    fn test_prepare_edit_builds_transparent_mask() {
        let input = Blob::new(png_fixture(30, 20), "image/png");
        let prepared = prepare_edit(&input, 1024 * 1024).unwrap();

        assert_eq!((prepared.width, prepared.height), (30, 20));
        assert_eq!(prepared.size.size, CanvasSize::Landscape);

        let mask = image::load_from_memory(&prepared.mask_png).unwrap().to_rgba8();
        assert_eq!(mask.dimensions(), (30, 20));
        assert!(mask.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_prepare_edit_rejects_oversized_input() {
        let input = Blob::new(png_fixture(4, 4), "image/png");
        let err = prepare_edit(&input, 10).unwrap_err();
        assert!(matches!(err, TransformError::InputTooLarge { max: 10, .. }));
    }

    #[test]
    fn test_prepare_edit_rejects_unsupported_type() {
        let input = Blob::new(png_fixture(4, 4), "image/gif");
        assert!(matches!(
            prepare_edit(&input, 1024 * 1024),
            Err(TransformError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_prepare_edit_rejects_corrupt_bytes() {
        let input = Blob::new(b"definitely not a png".to_vec(), "image/png");
        assert!(matches!(
            prepare_edit(&input, 1024 * 1024),
            Err(TransformError::Decode(_))
        ));
    }

    #[test]
    fn test_image_content_type_sniffs_png() {
        assert_eq!(image_content_type(&png_fixture(2, 2)).unwrap(), "image/png");
        assert!(image_content_type(b"plain text").is_err());
    }

    #[test]
    fn test_edits_url_tolerates_trailing_slash() {
        let config = TransformConfig {
            api_base: "https://images.example.test/v1/".to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-image-1".to_string(),
            prompt: "restyle".to_string(),
            max_input_bytes: 1024,
            timeout_secs: 5,
        };
        let transformer = OpenAiTransformer::new(&config).unwrap();
        assert_eq!(
            transformer.edits_url(),
            "https://images.example.test/v1/images/edits"
        );
    }
}
