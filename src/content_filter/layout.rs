const DEFAULT_BATCH: i64 = 1;
const DEFAULT_SIDE: i64 = 224;
const DEFAULT_CHANNELS: i64 = 3;

/// Spatial size and channel ordering a model expects its input image in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLayout {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    /// NHWC when true, NCHW otherwise.
    pub channels_last: bool,
}

impl ModelLayout {
    /// Used when the declared input shape cannot be interpreted.
    pub const FALLBACK: ModelLayout = ModelLayout {
        height: DEFAULT_SIDE as usize,
        width: DEFAULT_SIDE as usize,
        channels: DEFAULT_CHANNELS as usize,
        channels_last: true,
    };

    /// Number of elements in one packed input image.
    pub fn element_count(&self) -> usize {
        self.height * self.width * self.channels
    }
}

/// The layout together with the fully positive input shape fed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub layout: ModelLayout,
    pub shape: Vec<i64>,
    /// True when the declared shape could not be interpreted and the fallback was used.
    pub fallback: bool,
}

fn fill(dim: &mut i64, default: i64) {
    if *dim <= 0 {
        *dim = default;
    }
}

/// Infers layout from a declared input shape, substituting defaults for
/// non-positive (dynamic) dimensions.
///
/// A trailing dimension of 3 (or unknown) means channels-last, otherwise a
/// dimension 1 of 3 (or unknown) means channels-first. Anything else,
/// including rank below 4, falls back to NHWC 1x224x224x3. This never fails.
///
/// Known limitation: the channel axis is identified by the value 3, so a
/// model with a spatial side of 3, or with 1 or 4 channels, is misread.
pub fn resolve_input(declared: &[i64]) -> ResolvedInput {
    if declared.len() >= 4 {
        let mut shape = declared.to_vec();

        if shape[3] == 3 || shape[3] <= 0 {
            fill(&mut shape[0], DEFAULT_BATCH);
            fill(&mut shape[1], DEFAULT_SIDE);
            fill(&mut shape[2], DEFAULT_SIDE);
            fill(&mut shape[3], DEFAULT_CHANNELS);
            clamp_trailing(&mut shape);
            let layout = ModelLayout {
                height: shape[1] as usize,
                width: shape[2] as usize,
                channels: shape[3] as usize,
                channels_last: true,
            };
            return ResolvedInput {
                layout,
                shape,
                fallback: false,
            };
        }

        if shape[1] == 3 || shape[1] <= 0 {
            fill(&mut shape[0], DEFAULT_BATCH);
            fill(&mut shape[2], DEFAULT_SIDE);
            fill(&mut shape[3], DEFAULT_SIDE);
            fill(&mut shape[1], DEFAULT_CHANNELS);
            clamp_trailing(&mut shape);
            let layout = ModelLayout {
                height: shape[2] as usize,
                width: shape[3] as usize,
                channels: shape[1] as usize,
                channels_last: false,
            };
            return ResolvedInput {
                layout,
                shape,
                fallback: false,
            };
        }
    }

    let layout = ModelLayout::FALLBACK;
    ResolvedInput {
        layout,
        shape: vec![
            DEFAULT_BATCH,
            layout.height as i64,
            layout.width as i64,
            layout.channels as i64,
        ],
        fallback: true,
    }
}

// Dimensions past the first four only occur in odd exports; pin unknown ones to 1.
fn clamp_trailing(shape: &mut [i64]) {
    for dim in shape.iter_mut().skip(4) {
        fill(dim, 1);
    }
}

/// Replaces every non-positive entry of a declared output shape with 1.
pub fn sanitize_output_shape(declared: &[i64]) -> Vec<i64> {
    declared.iter().map(|&dim| if dim <= 0 { 1 } else { dim }).collect()
}

/// Element count of a fully positive shape.
pub fn element_count(shape: &[i64]) -> usize {
    shape.iter().map(|&dim| dim.max(0) as usize).product()
}
