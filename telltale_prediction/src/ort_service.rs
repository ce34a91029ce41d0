use crate::{
    preprocess::InputSize,
    registry::{Classifier, ModelError, ModelLoader},
};
use ndarray::Array4;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Builds ONNX Runtime sessions for the models found on disk.
#[derive(Debug, Clone)]
pub struct OrtModelLoader {
    num_instances: usize,
}

impl OrtModelLoader {
    pub fn new(num_instances: usize) -> Self {
        Self {
            num_instances: num_instances.max(1),
        }
    }
}

impl ModelLoader for OrtModelLoader {
    fn load(&self, model_file: &Path) -> Result<Box<dyn Classifier>, ModelError> {
        let sessions = (0..self.num_instances)
            .map(|_| {
                let session = Session::builder()
                    .map_err(load_error)?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(load_error)?
                    .commit_from_file(model_file)
                    .map_err(load_error)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        let input_size = detect_input_size(&sessions[0].lock());
        tracing::info!(
            "Created {} ONNX sessions for {:?}, detected input size {:?}",
            sessions.len(),
            model_file,
            input_size
        );

        Ok(Box::new(OrtClassifier {
            sessions,
            counter: AtomicUsize::new(0),
            input_size,
        }))
    }
}

fn load_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::Load(e.to_string())
}

/// Reads `(N, H, W, C)` from the first graph input. Dynamic dimensions are
/// reported as non-positive values and yield `None`.
fn detect_input_size(session: &Session) -> Option<InputSize> {
    let shape = session.inputs.first()?.input_type.tensor_shape()?;
    if shape.len() != 4 || shape[1] <= 0 || shape[2] <= 0 {
        return None;
    }
    Some(InputSize {
        height: u32::try_from(shape[1]).ok()?,
        width: u32::try_from(shape[2]).ok()?,
    })
}

pub struct OrtClassifier {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    input_size: Option<InputSize>,
}

impl Classifier for OrtClassifier {
    fn input_size(&self) -> Option<InputSize> {
        self.input_size
    }

    fn classify(&self, input: Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index].lock();
        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(format!("failed to extract tensor: {}", e)))?;

        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_invalid_graph() {
        let dir = tempfile::tempdir().unwrap();
        let model_file = dir.path().join("model.onnx");
        std::fs::write(&model_file, b"definitely not protobuf").unwrap();

        let result = OrtModelLoader::new(1).load(&model_file);
        assert!(matches!(result, Err(ModelError::Load(_))));
    }
}
