use std::fmt;

use anyhow::Result;

pub mod layout;
pub mod onnx;
pub mod preprocess;

pub use layout::ModelLayout;
pub use onnx::OnnxSession;
pub use preprocess::PreprocessError;

/// Scores above this hide the image.
const NSFW_THRESHOLD: f32 = 0.3;

// Class indices produced by the moderation model:
// 0: drawings (safe)
// 1: hentai (BLOCK)
// 2: neutral (safe)
// 3: porn (BLOCK)
// 4: sexy (BLOCK)
const CLASS_DRAWINGS: usize = 0;
const CLASS_HENTAI: usize = 1;
const CLASS_NEUTRAL: usize = 2;
const CLASS_PORN: usize = 3;
const CLASS_SEXY: usize = 4;
const CLASS_COUNT: usize = 5;

/// A loaded model that turns one packed image into class scores.
///
/// Implementations are not reentrant; `run` takes `&mut self` so callers
/// cannot overlap invocations.
pub trait InferenceSession {
    /// Input layout resolved when the model was loaded.
    fn layout(&self) -> &ModelLayout;

    /// Runs the model on one image buffer of `layout().element_count()` values.
    fn run(&mut self, input: Vec<f32>) -> Result<Vec<f32>>;
}

/// Why a single image could not be classified.
#[derive(Debug)]
pub enum FilterError {
    Preprocess(PreprocessError),
    Inference(anyhow::Error),
    MissingScores { len: usize },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Preprocess(err) => write!(f, "preprocessing failed: {err}"),
            FilterError::Inference(err) => write!(f, "inference failed: {err:#}"),
            FilterError::MissingScores { len } => {
                write!(f, "model produced {len} scores, expected at least {CLASS_COUNT}")
            }
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FilterError::Preprocess(err) => Some(err),
            FilterError::Inference(err) => Some(err.as_ref()),
            FilterError::MissingScores { .. } => None,
        }
    }
}

impl From<PreprocessError> for FilterError {
    fn from(value: PreprocessError) -> Self {
        FilterError::Preprocess(value)
    }
}

/// Decides whether the class scores call for hiding the image.
pub fn classify(scores: &[f32]) -> Result<bool, FilterError> {
    if scores.len() < CLASS_COUNT {
        return Err(FilterError::MissingScores { len: scores.len() });
    }

    let hentai = scores[CLASS_HENTAI];
    let porn = scores[CLASS_PORN];
    let sexy = scores[CLASS_SEXY];
    let should_hide = hentai > NSFW_THRESHOLD || porn > NSFW_THRESHOLD || sexy > NSFW_THRESHOLD;

    log::info!(
        "Inference output: [{:.4}, {:.4}, {:.4}, {:.4}, {:.4}] (drawings, hentai, neutral, porn, sexy), should hide: {}",
        scores[CLASS_DRAWINGS],
        hentai,
        scores[CLASS_NEUTRAL],
        porn,
        sexy,
        should_hide
    );
    Ok(should_hide)
}

/// Image moderation on top of an inference session.
pub struct ContentFilter<S> {
    session: S,
}

impl<S: InferenceSession> ContentFilter<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }

    /// Decodes, preprocesses and classifies one base64 image.
    pub fn should_hide(&mut self, image_data: &str) -> Result<bool, FilterError> {
        let layout = *self.session.layout();
        let input = preprocess::prepare(image_data, &layout)?;
        let scores = self.session.run(input).map_err(FilterError::Inference)?;
        classify(&scores)
    }

    pub fn into_session(self) -> S {
        self.session
    }
}
