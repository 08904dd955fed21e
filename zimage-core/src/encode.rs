use std::io::Cursor;

use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::Serialize;
use tracing::{error, info};

use crate::{ErrorKind, GenerationResult, JobError};

/// The single JSON object returned for every job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Success {
        image_base64: String,
        width: u32,
        height: u32,
        steps: u32,
    },
    Error {
        #[serde(skip)]
        kind: ErrorKind,
        error: String,
    },
}

impl JobOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutput::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutput::Success { .. } => None,
            JobOutput::Error { kind, .. } => Some(*kind),
        }
    }
}

impl From<JobError> for JobOutput {
    fn from(err: JobError) -> Self {
        encode_error(err.kind, err.message)
    }
}

/// Encodes `img` as a PNG and returns the raw container bytes.
fn image_to_png(img: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

pub fn encode_success(result: &GenerationResult) -> Result<JobOutput, JobError> {
    let png = image_to_png(&result.image).map_err(|e| {
        error!("Failed to encode image to PNG: {e:#}");
        JobError::new(ErrorKind::Unknown, "Image encoding failed")
    })?;
    if png.is_empty() {
        error!("Generated image is empty");
        return Err(JobError::new(ErrorKind::Unknown, "Image encoding failed"));
    }

    let image_base64 = BASE64_STANDARD.encode(&png);
    info!(
        "Image encoded to base64: {} chars ({} bytes)",
        image_base64.len(),
        png.len()
    );

    Ok(JobOutput::Success {
        image_base64,
        width: result.width,
        height: result.height,
        steps: result.steps,
    })
}

pub fn encode_error(kind: ErrorKind, message: impl Into<String>) -> JobOutput {
    JobOutput::Error {
        kind,
        error: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7) as u8, (y * 13) as u8, ((x + y) * 3) as u8])
        }))
    }

    #[test]
    fn success_round_trips_losslessly() {
        let image = gradient(48, 32);
        let result = GenerationResult {
            image: image.clone(),
            width: 48,
            height: 32,
            steps: 9,
        };

        let JobOutput::Success { image_base64, .. } = encode_success(&result).unwrap() else {
            panic!("expected a success envelope");
        };
        let png = BASE64_STANDARD.decode(image_base64).unwrap();
        assert_eq!(png, image_to_png(&image).unwrap());
        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);

        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!(decoded.to_rgb8().into_raw(), image.to_rgb8().into_raw());
    }

    #[test]
    fn success_echoes_parameters() {
        let result = GenerationResult {
            image: gradient(4, 4),
            width: 1024,
            height: 576,
            steps: 16,
        };
        let value = serde_json::to_value(encode_success(&result).unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 4);
        assert_eq!(value["width"], 1024);
        assert_eq!(value["height"], 576);
        assert_eq!(value["steps"], 16);
        assert!(value["image_base64"].is_string());
    }

    #[test]
    fn unencodable_image_is_an_unknown_failure() {
        // PNG has no 32-bit float layout.
        let result = GenerationResult {
            image: DynamicImage::new_rgb32f(4, 4),
            width: 4,
            height: 4,
            steps: 9,
        };
        let err = encode_success(&result).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.message, "Image encoding failed");
    }

    #[test]
    fn error_hides_the_kind() {
        let output = encode_error(ErrorKind::OutOfMemory, "GPU out of memory. Please retry.");
        assert_eq!(output.error_kind(), Some(ErrorKind::OutOfMemory));
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({ "error": "GPU out of memory. Please retry." })
        );
    }
}
