use crate::{
    preprocess::{preprocess, Normalization, PreprocessError},
    registry::{ActiveModel, ModelError, ModelLoader, ModelRegistry},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

pub const TOP_K: usize = 5;
pub const ACCEPTED_EXTENSION: &str = ".png";
pub const SUCCESS_STATUS: &str = "Success";
pub const ERROR_PREDICTION: &str = "Error";

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("no model is loaded")]
    NoModelLoaded,
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model returned no scores")]
    EmptyOutput,
    #[error("prediction task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub class: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction: String,
    pub confidence: f32,
    pub filename: String,
    pub top5: Vec<ClassScore>,
}

/// One entry of a batch response. Failures keep their slot with the error
/// message as status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub filename: String,
    pub prediction: String,
    pub confidence: f32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top5: Option<Vec<ClassScore>>,
}

impl BatchRecord {
    fn failed(filename: String, error: &PredictionError) -> Self {
        Self {
            filename,
            prediction: ERROR_PREDICTION.to_string(),
            confidence: 0.0,
            status: error.to_string(),
            top5: None,
        }
    }
}

impl From<PredictionResult> for BatchRecord {
    fn from(result: PredictionResult) -> Self {
        Self {
            filename: result.filename,
            prediction: result.prediction,
            confidence: result.confidence,
            status: SUCCESS_STATUS.to_string(),
            top5: Some(result.top5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub fn is_accepted_filename(filename: &str) -> bool {
    filename.to_lowercase().ends_with(ACCEPTED_EXTENSION)
}

/// Indices ordered by descending score, cut to `k`. Equal scores keep their
/// original order.
pub fn rank_top_k(scores: &[f32], model: &ActiveModel, k: usize) -> Vec<ClassScore> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    indices
        .into_iter()
        .take(k)
        .map(|idx| ClassScore {
            class: model.label(idx).to_string(),
            confidence: scores[idx],
        })
        .collect()
}

pub struct PredictionService<L: ModelLoader> {
    registry: Arc<ModelRegistry<L>>,
    normalization: Normalization,
}

impl<L: ModelLoader> Clone for PredictionService<L> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            normalization: self.normalization,
        }
    }
}

impl<L: ModelLoader> PredictionService<L> {
    pub fn new(registry: Arc<ModelRegistry<L>>, normalization: Normalization) -> Self {
        Self {
            registry,
            normalization,
        }
    }

    pub fn predict_with(
        &self,
        model: &ActiveModel,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PredictionResult, PredictionError> {
        let input = preprocess(bytes, model.input_size, self.normalization)?;
        let scores = model.classify(input)?;

        let top5 = rank_top_k(&scores, model, TOP_K);
        let best = top5.first().ok_or(PredictionError::EmptyOutput)?;

        tracing::debug!(
            "Predicted '{}' ({:.3}) for {}",
            best.class,
            best.confidence,
            filename
        );

        Ok(PredictionResult {
            prediction: best.class.clone(),
            confidence: best.confidence,
            filename: filename.to_string(),
            top5,
        })
    }

    pub fn predict_blocking(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PredictionResult, PredictionError> {
        let model = self.registry.active().ok_or(PredictionError::NoModelLoaded)?;
        self.predict_with(&model, filename, bytes)
    }

    /// Scores every accepted file against one model snapshot. Files with
    /// another extension are dropped from the output.
    pub fn predict_batch_blocking(&self, files: Vec<UploadedFile>) -> Vec<BatchRecord> {
        let model = self.registry.active();

        files
            .into_iter()
            .filter(|file| {
                let accepted = is_accepted_filename(&file.filename);
                if !accepted {
                    tracing::debug!("Skipping non-PNG file {}", file.filename);
                }
                accepted
            })
            .map(|file| {
                let result = match &model {
                    Some(model) => self.predict_with(model, &file.filename, &file.bytes),
                    None => Err(PredictionError::NoModelLoaded),
                };
                match result {
                    Ok(prediction) => BatchRecord::from(prediction),
                    Err(e) => {
                        tracing::warn!("Prediction failed for {}: {}", file.filename, e);
                        BatchRecord::failed(file.filename, &e)
                    }
                }
            })
            .collect()
    }

    #[instrument(skip(self, bytes))]
    pub async fn predict(
        &self,
        filename: String,
        bytes: Vec<u8>,
    ) -> Result<PredictionResult, PredictionError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.predict_blocking(&filename, &bytes))
            .await
            .map_err(|e| PredictionError::Task(e.to_string()))?
    }

    #[instrument(skip(self, files), fields(count = files.len()))]
    pub async fn predict_batch(
        &self,
        files: Vec<UploadedFile>,
    ) -> Result<Vec<BatchRecord>, PredictionError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.predict_batch_blocking(files))
            .await
            .map_err(|e| PredictionError::Task(e.to_string()))
    }
}
