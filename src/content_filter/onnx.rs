use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ort::session::Session;
use ort::value::{Tensor, ValueType};

use super::InferenceSession;
use super::layout::{self, ModelLayout};

/// Errors that make the model unusable. All of them are fatal at startup.
#[derive(Debug)]
pub enum LoadError {
    LibraryNotFound(PathBuf),
    ModelNotFound(PathBuf),
    Runtime(ort::Error),
    NoInputs(PathBuf),
    NoOutputs(PathBuf),
    InputArity { path: PathBuf, count: usize },
    OutputArity { path: PathBuf, count: usize },
    UnsupportedInput(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::LibraryNotFound(path) => {
                write!(f, "ONNX Runtime library not found at: {}", path.display())
            }
            LoadError::ModelNotFound(path) => {
                write!(f, "model file not found: {}", path.display())
            }
            LoadError::Runtime(err) => write!(f, "ONNX Runtime error: {err}"),
            LoadError::NoInputs(path) => {
                write!(f, "model {} does not expose any inputs", path.display())
            }
            LoadError::NoOutputs(path) => {
                write!(f, "model {} does not expose any outputs", path.display())
            }
            LoadError::InputArity { path, count } => write!(
                f,
                "model {} expects {count} inputs, only a single input is supported",
                path.display()
            ),
            LoadError::OutputArity { path, count } => write!(
                f,
                "model {} produces {count} outputs, only a single output is supported",
                path.display()
            ),
            LoadError::UnsupportedInput(name) => {
                write!(f, "model input '{name}' is not a tensor")
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Runtime(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ort::Error> for LoadError {
    fn from(value: ort::Error) -> Self {
        LoadError::Runtime(value)
    }
}

/// Loads the ONNX Runtime shared library and sets up the process-wide environment.
pub fn init_runtime(library_path: &Path) -> Result<(), LoadError> {
    if !library_path.exists() {
        return Err(LoadError::LibraryNotFound(library_path.to_path_buf()));
    }
    ort::init_from(library_path.display().to_string())
        .with_name("image-guard")
        .commit()?;
    Ok(())
}

/// Single-input, single-output ONNX model session.
pub struct OnnxSession {
    session: Session,
    input_name: String,
    output_name: String,
    input_shape: Vec<i64>,
    output_shape: Vec<i64>,
    layout: ModelLayout,
}

impl OnnxSession {
    /// Loads the model and resolves its input layout and output shape once.
    pub fn load(model_path: &Path) -> Result<Self, LoadError> {
        if !model_path.exists() {
            return Err(LoadError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder().and_then(|b| b.commit_from_file(model_path))?;

        let path = model_path.to_path_buf();
        match session.inputs.len() {
            0 => return Err(LoadError::NoInputs(path)),
            1 => {}
            count => return Err(LoadError::InputArity { path, count }),
        }
        match session.outputs.len() {
            0 => return Err(LoadError::NoOutputs(path)),
            1 => {}
            count => return Err(LoadError::OutputArity { path, count }),
        }

        let input = &session.inputs[0];
        let output = &session.outputs[0];
        let declared_input = tensor_dims(&input.input_type)
            .ok_or_else(|| LoadError::UnsupportedInput(input.name.clone()))?;
        // A non-tensor output is left to fail at extraction time.
        let declared_output = tensor_dims(&output.output_type).unwrap_or_default();

        let resolved = layout::resolve_input(&declared_input);
        if resolved.fallback {
            log::warn!(
                "fallback to NHWC 1x224x224x3 for input shape {:?}",
                declared_input
            );
        }
        let output_shape = layout::sanitize_output_shape(&declared_output);
        let input_name = input.name.clone();
        let output_name = output.name.clone();

        log::info!(
            "ONNX session created for {}: input '{}' {:?} output '{}' {:?} channels_last={}",
            model_path.display(),
            input_name,
            resolved.shape,
            output_name,
            output_shape,
            resolved.layout.channels_last
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            input_shape: resolved.shape,
            output_shape,
            layout: resolved.layout,
        })
    }

    /// Releases the native session. Consuming `self` guarantees this happens once.
    pub fn close(self) {
        drop(self.session);
        log::info!("ONNX session released");
    }
}

fn tensor_dims(value_type: &ValueType) -> Option<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Some(shape.to_vec()),
        _ => None,
    }
}

impl InferenceSession for OnnxSession {
    fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    fn run(&mut self, input: Vec<f32>) -> Result<Vec<f32>> {
        let expected = layout::element_count(&self.input_shape);
        if input.len() != expected {
            bail!(
                "input buffer has {} values, model input {:?} needs {}",
                input.len(),
                self.input_shape,
                expected
            );
        }

        // The tensor owns the buffer and is dropped with `outputs`, on success or failure.
        let tensor = Tensor::from_array((self.input_shape.clone(), input))
            .context("failed to create input tensor")?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .context("failed to run model inference")?;

        let (_, scores) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .with_context(|| format!("failed to read output '{}' as f32", self.output_name))?;

        let wanted = layout::element_count(&self.output_shape);
        if scores.len() < wanted {
            bail!(
                "output '{}' has {} values, declared shape {:?} needs {}",
                self.output_name,
                scores.len(),
                self.output_shape,
                wanted
            );
        }
        Ok(scores.to_vec())
    }
}
