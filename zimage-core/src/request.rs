use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::JobError;

/// Longest accepted prompt, in characters, after trimming.
pub const MAX_PROMPT_CHARS: usize = 1000;

const PROMPT_REQUIRED: &str = "Prompt is required";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Basic,
    High,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "9:16")]
    Portrait,
}

/// A validated job input. Only [`validate`] builds one from wire data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub quality: Quality,
    pub aspect_ratio: AspectRatio,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, quality: Quality, aspect_ratio: AspectRatio) -> Self {
        Self {
            prompt: prompt.into(),
            quality,
            aspect_ratio,
        }
    }
}

/// Validates the `input` object of a job.
///
/// The prompt is trimmed and must hold between 1 and [`MAX_PROMPT_CHARS`]
/// characters. `quality` and `aspectRatio` fall back to their defaults when
/// absent or unrecognized.
pub fn validate(raw: &Value) -> Result<GenerationRequest, JobError> {
    let input = raw
        .as_object()
        .ok_or_else(|| JobError::invalid_input("Input must be a JSON object"))?;

    let prompt = input
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if prompt.is_empty() {
        return Err(JobError::invalid_input(PROMPT_REQUIRED));
    }
    let prompt_chars = prompt.chars().count();
    if prompt_chars > MAX_PROMPT_CHARS {
        return Err(JobError::invalid_input(format!(
            "Prompt must be at most {MAX_PROMPT_CHARS} characters (got {prompt_chars})"
        )));
    }

    Ok(GenerationRequest {
        prompt: prompt.to_string(),
        quality: enum_or_default(input.get("quality"), "quality"),
        aspect_ratio: enum_or_default(input.get("aspectRatio"), "aspectRatio"),
    })
}

fn enum_or_default<T>(value: Option<&Value>, field: &str) -> T
where
    T: for<'de> Deserialize<'de> + Default + std::fmt::Debug,
{
    let Some(value) = value else {
        return T::default();
    };
    match value.as_str().map(|raw| serde_plain::from_str::<T>(raw)) {
        Some(Ok(parsed)) => parsed,
        _ => {
            let fallback = T::default();
            warn!("Unrecognized {field} value {value}, using default {fallback:?}");
            fallback
        }
    }
}
