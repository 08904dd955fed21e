use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    encode_success, invoke, recover, resolve, validate, EngineHandle, JobError, JobOutput,
};

/// Characters of the prompt echoed into debug logs.
const PROMPT_LOG_CHARS: usize = 100;

/// Handles one job from raw `input` to the wire envelope.
///
/// Every job-scoped failure ends up as an error envelope; nothing here can take
/// the worker down.
pub fn handle_job(engine: &EngineHandle, input: &Value) -> JobOutput {
    let request = match validate(input) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected job input: {}", e.message);
            return e.into();
        }
    };
    let params = resolve(&request);

    info!(
        "Generating image: quality={:?}, aspect={:?}, steps={}, size={}x{}",
        request.quality, request.aspect_ratio, params.steps, params.width, params.height
    );
    debug!(
        "Prompt ({} chars): {}",
        request.prompt.chars().count(),
        request.prompt.chars().take(PROMPT_LOG_CHARS).collect::<String>()
    );
    if engine.record_job() {
        info!("Serving first job on this worker (cold)");
    }

    let outcome = engine.with_engine(|model| {
        invoke(model, &request, &params).map_err(|fault| recover(fault, model))
    });

    match outcome.and_then(|result| encode_success(&result)) {
        Ok(output) => output,
        Err(JobError { kind, message }) => {
            warn!("Job failed: kind={kind}, message={message}");
            JobOutput::Error {
                kind,
                error: message,
            }
        }
    }
}
