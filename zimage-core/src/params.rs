use serde::Serialize;

use crate::{AspectRatio, GenerationRequest, Quality};

/// Concrete generation settings derived from a [`GenerationRequest`].
///
/// Fields are readable everywhere but only [`resolve`] builds a value, so the
/// engine never sees settings outside the step and dimension tables:
///
/// ```compile_fail
/// let params = zimage_core::ResolvedParameters {
///     steps: 42,
///     width: 1000,
///     height: 1000,
///     guidance_scale: 7.5,
/// };
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ResolvedParameters {
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    /// Always 0.0; this model family runs without classifier-free guidance.
    pub guidance_scale: f64,
}

impl Quality {
    pub fn steps(self) -> u32 {
        match self {
            Quality::Basic => 9,
            Quality::High => 16,
        }
    }
}

impl AspectRatio {
    /// Pixel dimensions as `(width, height)`.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            AspectRatio::Landscape => (1024, 576),
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait => (576, 1024),
        }
    }
}

pub fn resolve(request: &GenerationRequest) -> ResolvedParameters {
    let (width, height) = request.aspect_ratio.dimensions();
    ResolvedParameters {
        steps: request.quality.steps(),
        width,
        height,
        guidance_scale: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn every_combination_stays_inside_the_tables(
        #[values(Quality::Basic, Quality::High)] quality: Quality,
        #[values(AspectRatio::Landscape, AspectRatio::Square, AspectRatio::Portrait)]
        aspect_ratio: AspectRatio,
    ) {
        let params = resolve(&GenerationRequest::new("x", quality, aspect_ratio));
        assert!([9, 16].contains(&params.steps));
        assert!([(1024, 576), (1024, 1024), (576, 1024)].contains(&(params.width, params.height)));
        assert_eq!(params.guidance_scale, 0.0);
        assert_eq!(params, resolve(&GenerationRequest::new("y", quality, aspect_ratio)));
    }

    #[test]
    fn basic_landscape() {
        let params = resolve(&GenerationRequest::new(
            "A cat",
            Quality::Basic,
            AspectRatio::Landscape,
        ));
        assert_eq!(
            params,
            ResolvedParameters {
                steps: 9,
                width: 1024,
                height: 576,
                guidance_scale: 0.0,
            }
        );
    }

    #[test]
    fn high_square() {
        let params = resolve(&GenerationRequest::new("x", Quality::High, AspectRatio::Square));
        assert_eq!((params.steps, params.width, params.height), (16, 1024, 1024));
    }

    #[test]
    fn dimensions_are_multiples_of_sixteen() {
        for ratio in [AspectRatio::Landscape, AspectRatio::Square, AspectRatio::Portrait] {
            let (width, height) = ratio.dimensions();
            assert_eq!(width % 16, 0);
            assert_eq!(height % 16, 0);
        }
    }
}
