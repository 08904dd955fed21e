use tracing::{error, warn};

use crate::{EngineFault, ErrorKind, JobError, ModelEngine};

pub const OUT_OF_MEMORY_MESSAGE: &str = "GPU out of memory. Please retry.";
pub const UNKNOWN_FAILURE_MESSAGE: &str = "Image generation failed. Please retry.";

/// Maps an engine fault onto the job-scoped taxonomy.
pub fn classify(fault: &EngineFault) -> ErrorKind {
    match fault {
        EngineFault::OutOfMemory => ErrorKind::OutOfMemory,
        EngineFault::Other(_) => ErrorKind::Unknown,
    }
}

/// Classifies `fault`, runs the matching recovery and returns the error the
/// caller will see. The engine stays loaded whatever happens here.
pub fn recover(fault: EngineFault, engine: &mut dyn ModelEngine) -> JobError {
    let kind = classify(&fault);
    match kind {
        ErrorKind::OutOfMemory => {
            error!("GPU out of memory during generation");
            if let Err(e) = engine.release_cache() {
                warn!("Failed to release device memory: {e:#}");
            }
            JobError::new(kind, OUT_OF_MEMORY_MESSAGE)
        }
        _ => {
            error!("Unexpected error during generation: {fault:#}");
            JobError::new(kind, UNKNOWN_FAILURE_MESSAGE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use image::DynamicImage;

    #[derive(Default)]
    struct CountingEngine {
        releases: usize,
        fail_release: bool,
    }

    impl ModelEngine for CountingEngine {
        fn generate(
            &mut self,
            _prompt: &str,
            _steps: u32,
            _guidance_scale: f64,
            width: u32,
            height: u32,
        ) -> Result<DynamicImage, EngineFault> {
            Ok(DynamicImage::new_rgb8(width, height))
        }

        fn release_cache(&mut self) -> anyhow::Result<()> {
            self.releases += 1;
            if self.fail_release {
                anyhow::bail!("device busy");
            }
            Ok(())
        }
    }

    #[test]
    fn out_of_memory_is_recognized_by_variant() {
        assert_eq!(classify(&EngineFault::OutOfMemory), ErrorKind::OutOfMemory);
        // Message text alone never makes a fault an OOM.
        let lookalike = EngineFault::Other(anyhow!("CUDA out of memory"));
        assert_eq!(classify(&lookalike), ErrorKind::Unknown);
    }

    #[test]
    fn out_of_memory_releases_the_cache() {
        let mut engine = CountingEngine::default();
        let err = recover(EngineFault::OutOfMemory, &mut engine);
        assert_eq!(err, JobError::new(ErrorKind::OutOfMemory, OUT_OF_MEMORY_MESSAGE));
        assert_eq!(engine.releases, 1);
    }

    #[test]
    fn failed_release_still_reports_out_of_memory() {
        let mut engine = CountingEngine {
            fail_release: true,
            ..Default::default()
        };
        let err = recover(EngineFault::OutOfMemory, &mut engine);
        assert_eq!(err.kind, ErrorKind::OutOfMemory);
        assert_eq!(err.message, OUT_OF_MEMORY_MESSAGE);
    }

    #[test]
    fn other_faults_get_a_generic_message() {
        let mut engine = CountingEngine::default();
        let err = recover(
            EngineFault::Other(anyhow!("tokenizer exploded at /secret/path")),
            &mut engine,
        );
        assert_eq!(err, JobError::new(ErrorKind::Unknown, UNKNOWN_FAILURE_MESSAGE));
        assert_eq!(engine.releases, 0);
    }
}
