use image::DynamicImage;
use tracing::{debug, info};

use crate::{EngineFault, GenerationRequest, ModelEngine, ResolvedParameters};

/// What the engine produced, with the parameters that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
}

/// Runs one generation. Faults are handed back untouched; there is no retry.
pub fn invoke(
    engine: &mut dyn ModelEngine,
    request: &GenerationRequest,
    params: &ResolvedParameters,
) -> Result<GenerationResult, EngineFault> {
    info!(
        "Starting image generation: steps={}, size={}x{}",
        params.steps, params.width, params.height
    );
    let started = std::time::Instant::now();
    let image = engine.generate(
        &request.prompt,
        params.steps,
        params.guidance_scale,
        params.width,
        params.height,
    )?;
    if image.width() != params.width || image.height() != params.height {
        debug!(
            "Engine returned {}x{} for a {}x{} request",
            image.width(),
            image.height(),
            params.width,
            params.height
        );
    }
    info!("Image generation completed in {:.2?}", started.elapsed());

    Ok(GenerationResult {
        image,
        width: params.width,
        height: params.height,
        steps: params.steps,
    })
}
