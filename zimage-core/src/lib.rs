pub mod classify;
pub mod device_map;
pub mod encode;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod lifecycle;
pub mod params;
pub mod pipeline;
pub mod request;
mod flux;
mod util;

pub use classify::{classify, recover, OUT_OF_MEMORY_MESSAGE, UNKNOWN_FAILURE_MESSAGE};
pub use device_map::*;
pub use encode::{encode_error, encode_success, JobOutput};
pub use engine::{EngineConfig, Loader, ModelEngine};
pub use error::{EngineFault, ErrorKind, JobError, LifecycleError};
pub use flux::{FluxEngine, FluxLoader};
pub use invoke::{invoke, GenerationResult};
pub use lifecycle::{EngineHandle, LifecycleState, ProcessLifecycle};
pub use params::{resolve, ResolvedParameters};
pub use pipeline::handle_job;
pub use request::{validate, AspectRatio, GenerationRequest, Quality, MAX_PROMPT_CHARS};
pub(crate) use util::*;
