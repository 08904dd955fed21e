use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use image::DynamicImage;

use crate::{DeviceMap, EngineFault};

/// The generation capability the worker consumes.
///
/// Implementations own their weights and device state. Callers hold the engine
/// behind the lifecycle's lock, so `generate` may take `&mut self`.
pub trait ModelEngine: Send {
    fn generate(
        &mut self,
        prompt: &str,
        steps: u32,
        guidance_scale: f64,
        width: u32,
        height: u32,
    ) -> Result<DynamicImage, EngineFault>;

    /// Returns cached device memory after an allocation failure.
    fn release_cache(&mut self) -> Result<()>;
}

/// Settings needed to bring an engine up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub model: String,
    pub device_map: DeviceMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "black-forest-labs/FLUX.1-schnell".to_string(),
            device_map: DeviceMap::default(),
        }
    }
}

pub trait Loader {
    type Model: ModelEngine;

    fn load(api: Api, config: EngineConfig) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
