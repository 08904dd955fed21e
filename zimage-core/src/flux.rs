use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use image::DynamicImage;
use serde::de::DeserializeOwned;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{select_best_device, tensor_to_image, EngineConfig, EngineFault, Loader, ModelEngine};

const T5_MAX_TOKENS: usize = 256;
const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";
const CLIP_REPO: &str = "openai/clip-vit-large-patch14";

/// FLUX.1-schnell text-to-image pipeline on candle.
pub struct FluxEngine {
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    clip_max_tokens: usize,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxEngine {
    fn denoise(
        &mut self,
        prompt: &str,
        steps: usize,
        guidance: f64,
        width: usize,
        height: usize,
    ) -> candle_core::Result<Tensor> {
        let noise_img = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;

        let t5_tokens = t5_input_ids(encode_ids(&self.t5_tokenizer, prompt)?);
        let t5_input = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&t5_input)?;

        let clip_tokens = clip_input_ids(
            encode_ids(&self.clip_tokenizer, prompt)?,
            self.clip_max_tokens,
        );
        let clip_input = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&clip_input)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = sampling::get_schedule(steps, None);
        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            guidance,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("Decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        img.i(0)
    }
}

fn encode_ids(tokenizer: &Tokenizer, prompt: &str) -> candle_core::Result<Vec<u32>> {
    Ok(tokenizer
        .encode(prompt, true)
        .map_err(candle_core::Error::msg)?
        .get_ids()
        .to_vec())
}

/// Pads or cuts T5 ids to the fixed sequence length the transformer expects.
fn t5_input_ids(mut ids: Vec<u32>) -> Vec<u32> {
    ids.resize(T5_MAX_TOKENS, 0);
    ids
}

/// Cuts CLIP ids down to the position-embedding table, keeping the
/// end-of-text token in the last slot. Long prompts lose their tail on the
/// CLIP side only; T5 still sees the first [`T5_MAX_TOKENS`] tokens.
fn clip_input_ids(mut ids: Vec<u32>, max_len: usize) -> Vec<u32> {
    if max_len == 0 || ids.len() <= max_len {
        return ids;
    }
    let end_of_text = ids[ids.len() - 1];
    ids.truncate(max_len);
    ids[max_len - 1] = end_of_text;
    ids
}

impl ModelEngine for FluxEngine {
    fn generate(
        &mut self,
        prompt: &str,
        steps: u32,
        guidance_scale: f64,
        width: u32,
        height: u32,
    ) -> Result<DynamicImage, EngineFault> {
        let img = self
            .denoise(
                prompt,
                steps as usize,
                guidance_scale,
                width as usize,
                height as usize,
            )
            .map_err(fault_from_candle)?;
        Ok(tensor_to_image(&img)?)
    }

    fn release_cache(&mut self) -> Result<()> {
        // Intermediate tensors are already dropped; waiting on the device lets
        // their buffers actually go back to the allocator.
        self.device
            .synchronize()
            .context("failed to synchronize device")
    }
}

fn fault_from_candle(err: candle_core::Error) -> EngineFault {
    if is_out_of_memory(&err) {
        EngineFault::OutOfMemory
    } else {
        EngineFault::Other(err.into())
    }
}

fn is_out_of_memory(err: &candle_core::Error) -> bool {
    match err {
        candle_core::Error::WithBacktrace { inner, .. }
        | candle_core::Error::Context { inner, .. } => is_out_of_memory(inner),
        #[cfg(feature = "cuda")]
        candle_core::Error::Cuda(source) => cuda_out_of_memory(source.as_ref()),
        _ => false,
    }
}

#[cfg(feature = "cuda")]
fn cuda_out_of_memory(source: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    use candle_core::cuda_backend::cudarc::driver::{sys::CUresult, DriverError};
    use candle_core::cuda_backend::CudaError;

    let driver = match source.downcast_ref::<CudaError>() {
        Some(CudaError::Cuda(driver)) => Some(driver),
        _ => source.downcast_ref::<DriverError>(),
    };
    driver.is_some_and(|DriverError(code)| *code == CUresult::CUDA_ERROR_OUT_OF_MEMORY)
}

fn ensure_supported(model: &str) -> Result<()> {
    let name = model.to_uppercase();
    if name.contains("FLUX") && name.contains("SCHNELL") {
        Ok(())
    } else {
        anyhow::bail!("Unsupported model: {model} (only FLUX.1-schnell checkpoints are supported)")
    }
}

/// Fetches a safetensors file and memory-maps it.
async fn mmap_weights(
    repo: &ApiRepo,
    file: &str,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let path = repo
        .get(file)
        .await
        .with_context(|| format!("failed to fetch {file}"))?;
    // SAFETY: the hub cache is not rewritten while the worker runs.
    unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
        .with_context(|| format!("failed to map {file}"))
}

async fn fetch_tokenizer(repo: &ApiRepo, file: &str) -> Result<Tokenizer> {
    let path = repo
        .get(file)
        .await
        .with_context(|| format!("failed to fetch {file}"))?;
    Tokenizer::from_file(&path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed to load tokenizer {}", path.display()))
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn clip_text_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

async fn load_t5(
    api: &Api,
    dtype: DType,
    device: &Device,
) -> Result<(T5EncoderModel, Tokenizer)> {
    let repo = api.repo(Repo::with_revision(
        T5_REPO.to_string(),
        RepoType::Model,
        T5_REVISION.to_string(),
    ));
    let vb = mmap_weights(&repo, "model.safetensors", dtype, device).await?;
    let config_path = repo
        .get("config.json")
        .await
        .context("failed to fetch T5 config")?;
    let config: t5::Config = read_config(&config_path)?;
    let model = T5EncoderModel::load(vb, &config).context("failed to build T5 encoder")?;
    let tokenizer = fetch_tokenizer(&api.model(T5_TOKENIZER_REPO.to_string()), T5_TOKENIZER_FILE)
        .await?;
    Ok((model, tokenizer))
}

async fn load_clip(
    api: &Api,
    dtype: DType,
    device: &Device,
) -> Result<(ClipTextTransformer, Tokenizer, usize)> {
    let repo = api.model(CLIP_REPO.to_string());
    let config = clip_text_config();
    let vb = mmap_weights(&repo, "model.safetensors", dtype, device).await?;
    let model = ClipTextTransformer::new(vb.pp("text_model"), &config)
        .context("failed to build CLIP text encoder")?;
    let tokenizer = fetch_tokenizer(&repo, "tokenizer.json").await?;
    Ok((model, tokenizer, config.max_position_embeddings))
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxEngine;

    async fn load(api: Api, config: EngineConfig) -> Result<Self::Model> {
        ensure_supported(&config.model)?;
        info!("Loading {} with {:?}", config.model, config.device_map);

        let device = select_best_device(config.device_map).context("failed to set up device")?;
        // bf16 on accelerators, f32 where bf16 is unsupported.
        let dtype = device.bf16_default_to_f32();
        info!("Using dtype {dtype:?}");

        let (t5_model, t5_tokenizer) = load_t5(&api, dtype, &device).await?;
        debug!("T5 encoder ready");
        let (clip_model, clip_tokenizer, clip_max_tokens) =
            load_clip(&api, dtype, &device).await?;
        debug!("CLIP encoder ready (max {clip_max_tokens} tokens)");

        let repo = api.model(config.model.clone());
        let autoencoder_vb = mmap_weights(&repo, "ae.safetensors", dtype, &device).await?;
        let autoencoder = AutoEncoder::new(&autoencoder::Config::schnell(), autoencoder_vb)
            .context("failed to build autoencoder")?;
        let flux_vb = mmap_weights(&repo, "flux1-schnell.safetensors", dtype, &device).await?;
        let flux_model = Flux::new(&model::Config::schnell(), flux_vb)
            .context("failed to build flux transformer")?;

        Ok(FluxEngine {
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            clip_max_tokens,
            autoencoder,
            flux_model,
        })
    }
}
