use crate::preprocess::InputSize;
use ndarray::Array4;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

pub const MODEL_FILE: &str = "model.onnx";
pub const CLASS_MAP_FILE: &str = "class_map.json";
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid model name: {0:?}")]
    InvalidName(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Invalid class map at {path}: {reason}")]
    ClassMap { path: PathBuf, reason: String },
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A loaded network able to score a preprocessed image.
pub trait Classifier: Send + Sync {
    /// Spatial input size declared by the graph, when it is static.
    fn input_size(&self) -> Option<InputSize>;
    fn classify(&self, input: Array4<f32>) -> Result<Vec<f32>, ModelError>;
}

pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, model_file: &Path) -> Result<Box<dyn Classifier>, ModelError>;
}

/// Immutable view of the model serving predictions. Replaced as a whole on
/// every switch, never mutated in place.
pub struct ActiveModel {
    pub name: String,
    pub class_names: Vec<String>,
    pub input_size: InputSize,
    classifier: Box<dyn Classifier>,
}

impl ActiveModel {
    pub fn new(
        name: String,
        class_names: Vec<String>,
        input_size: InputSize,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        Self {
            name,
            class_names,
            input_size,
            classifier,
        }
    }

    pub fn classify(&self, input: Array4<f32>) -> Result<Vec<f32>, ModelError> {
        self.classifier.classify(input)
    }

    pub fn label(&self, index: usize) -> &str {
        self.class_names
            .get(index)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ModelListing {
    pub models: Vec<String>,
    pub current: String,
}

pub struct ModelRegistry<L: ModelLoader> {
    models_dir: PathBuf,
    default_model: String,
    loader: L,
    active: RwLock<Option<Arc<ActiveModel>>>,
}

impl<L: ModelLoader> ModelRegistry<L> {
    pub fn new(models_dir: impl Into<PathBuf>, default_model: impl Into<String>, loader: L) -> Self {
        Self {
            models_dir: models_dir.into(),
            default_model: default_model.into(),
            loader,
            active: RwLock::new(None),
        }
    }

    /// Prepares the models directory and loads the default model when present.
    /// A missing or broken default leaves the service running without a model.
    pub fn initialize(&self) {
        if let Err(e) = fs::create_dir_all(&self.models_dir) {
            tracing::error!("Failed to create models directory {:?}: {}", self.models_dir, e);
            return;
        }

        if !self.models_dir.join(&self.default_model).is_dir() {
            tracing::warn!(
                "Default model '{}' not found in {:?}, starting without a model",
                self.default_model,
                self.models_dir
            );
            return;
        }

        if let Err(e) = self.load_model(&self.default_model) {
            tracing::error!("Failed to load default model '{}': {}", self.default_model, e);
        }
    }

    pub fn active(&self) -> Option<Arc<ActiveModel>> {
        self.active.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn current_name(&self) -> String {
        self.active
            .read()
            .as_ref()
            .map(|model| model.name.clone())
            .unwrap_or_else(|| self.default_model.clone())
    }

    pub fn load_model(&self, name: &str) -> Result<Arc<ActiveModel>, ModelError> {
        validate_name(name)?;

        let model_dir = self.models_dir.join(name);
        let model_path = model_dir.join(MODEL_FILE);
        let class_map_path = model_dir.join(CLASS_MAP_FILE);

        if !model_path.is_file() {
            return Err(ModelError::NotFound(format!(
                "Model file not found at {}",
                model_path.display()
            )));
        }
        if !class_map_path.is_file() {
            return Err(ModelError::NotFound(format!(
                "Class map not found at {}",
                class_map_path.display()
            )));
        }

        tracing::info!("Loading model: {}", name);
        let classifier = self.loader.load(&model_path)?;
        let class_names = load_class_map(&class_map_path)?;
        let input_size = classifier.input_size().unwrap_or_default();

        let model = Arc::new(ActiveModel::new(
            name.to_string(),
            class_names,
            input_size,
            classifier,
        ));
        *self.active.write() = Some(model.clone());

        tracing::info!(
            "Successfully loaded model '{}' with {} classes, input {}x{}",
            name,
            model.class_names.len(),
            input_size.width,
            input_size.height
        );
        Ok(model)
    }

    pub fn list_models(&self) -> ModelListing {
        let mut models = match fs::read_dir(&self.models_dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().is_dir())
                .filter(|entry| has_model_assets(&entry.path()))
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect(),
            Err(e) => {
                tracing::debug!("Cannot read models directory {:?}: {}", self.models_dir, e);
                Vec::new()
            }
        };
        models.sort();

        ModelListing {
            models,
            current: self.current_name(),
        }
    }
}

fn has_model_assets(dir: &Path) -> bool {
    dir.join(MODEL_FILE).is_file() && dir.join(CLASS_MAP_FILE).is_file()
}

/// Only plain directory names are accepted so a request can never reach
/// outside the models directory.
fn validate_name(name: &str) -> Result<(), ModelError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if name.is_empty() || name == "." || name == ".." || !name.chars().all(allowed) {
        return Err(ModelError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Reads a `{"label": index}` map and returns the labels ordered by index.
pub fn load_class_map(path: &Path) -> Result<Vec<String>, ModelError> {
    let class_map_error = |reason: String| ModelError::ClassMap {
        path: path.to_path_buf(),
        reason,
    };

    let raw = fs::read_to_string(path).map_err(|e| class_map_error(e.to_string()))?;
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&raw).map_err(|e| class_map_error(e.to_string()))?;

    let mut entries = map
        .into_iter()
        .map(|(label, index)| match index.as_i64() {
            Some(index) => Ok((label, index)),
            None => Err(class_map_error(format!(
                "index of '{}' is not an integer: {}",
                label, index
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|(_, index)| *index);

    Ok(entries.into_iter().map(|(label, _)| label).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{write_model, MockLoader, MockModelSpec};
    use std::fs;

    fn spec(input_size: Option<u32>) -> MockModelSpec {
        MockModelSpec {
            input_size,
            scores: vec![0.1, 0.9],
            fail: false,
        }
    }

    #[test]
    fn test_class_map_sorted_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLASS_MAP_FILE);
        fs::write(&path, r#"{"warning": 2, "abs": 0, "zz_low_fuel": 1}"#).unwrap();

        let labels = load_class_map(&path).unwrap();
        assert_eq!(labels, vec!["abs", "zz_low_fuel", "warning"]);
    }

    #[test]
    fn test_class_map_rejects_non_integer_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLASS_MAP_FILE);
        fs::write(&path, r#"{"abs": "zero"}"#).unwrap();

        assert!(matches!(
            load_class_map(&path),
            Err(ModelError::ClassMap { .. })
        ));
    }

    #[test]
    fn test_load_model_replaces_active_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "v1", &spec(None), r#"{"a": 0, "b": 1}"#);
        write_model(dir.path(), "v2", &spec(Some(64)), r#"{"c": 1, "d": 0}"#);

        let registry = ModelRegistry::new(dir.path(), "v1", MockLoader);
        assert!(!registry.is_loaded());

        let first = registry.load_model("v1").unwrap();
        assert_eq!(first.input_size, InputSize::square(224));

        registry.load_model("v2").unwrap();
        let active = registry.active().unwrap();
        assert_eq!(active.name, "v2");
        assert_eq!(active.class_names, vec!["d", "c"]);
        assert_eq!(active.input_size, InputSize::square(64));

        // Holders of the previous snapshot keep a consistent view
        assert_eq!(first.class_names, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_model_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "v1", &spec(None), r#"{"a": 0}"#);

        let registry = ModelRegistry::new(dir.path(), "v1", MockLoader);
        registry.load_model("v1").unwrap();

        let err = registry.load_model("does_not_exist").err().unwrap();
        assert!(matches!(err, ModelError::NotFound(_)));
        assert!(err.to_string().contains("Model file not found"));
        assert_eq!(registry.current_name(), "v1");
    }

    #[test]
    fn test_missing_class_map_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("v1");
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(
            model_dir.join(MODEL_FILE),
            serde_json::to_string(&spec(None)).unwrap(),
        )
        .unwrap();

        let registry = ModelRegistry::new(dir.path(), "v1", MockLoader);
        let err = registry.load_model("v1").err().unwrap();
        assert!(err.to_string().contains("Class map not found"));
        assert!(!registry.is_loaded());
    }

    #[test]
    fn test_loader_failure_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "good", &spec(None), r#"{"a": 0}"#);
        let broken = dir.path().join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(MODEL_FILE), "not a model").unwrap();
        fs::write(broken.join(CLASS_MAP_FILE), r#"{"a": 0}"#).unwrap();

        let registry = ModelRegistry::new(dir.path(), "good", MockLoader);
        registry.load_model("good").unwrap();

        assert!(matches!(
            registry.load_model("broken"),
            Err(ModelError::Load(_))
        ));
        assert_eq!(registry.active().unwrap().name, "good");
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path().join("models"), "v1", MockLoader);

        for name in ["", ".", "..", "../models", "a/b", "a\\b", "/etc"] {
            assert!(
                matches!(registry.load_model(name), Err(ModelError::InvalidName(_))),
                "accepted {:?}",
                name
            );
        }
    }

    #[test]
    fn test_list_models_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "complete_b", &spec(None), r#"{"a": 0}"#);
        write_model(dir.path(), "complete_a", &spec(None), r#"{"a": 0}"#);

        let no_map = dir.path().join("no_map");
        fs::create_dir_all(&no_map).unwrap();
        fs::write(no_map.join(MODEL_FILE), "{}").unwrap();

        let no_model = dir.path().join("no_model");
        fs::create_dir_all(&no_model).unwrap();
        fs::write(no_model.join(CLASS_MAP_FILE), "{}").unwrap();

        fs::write(dir.path().join("stray.txt"), "").unwrap();

        let registry = ModelRegistry::new(dir.path(), "complete_a", MockLoader);
        let listing = registry.list_models();
        assert_eq!(listing.models, vec!["complete_a", "complete_b"]);
        assert_eq!(listing.current, "complete_a");
    }

    #[test]
    fn test_list_models_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path().join("missing"), "v1", MockLoader);
        assert!(registry.list_models().models.is_empty());
    }

    #[test]
    fn test_initialize_loads_default_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let models_dir = dir.path().join("models");
        let registry = ModelRegistry::new(&models_dir, "v1", MockLoader);

        registry.initialize();
        assert!(models_dir.is_dir());
        assert!(!registry.is_loaded());

        write_model(&models_dir, "v1", &spec(None), r#"{"a": 0}"#);
        registry.initialize();
        assert!(registry.is_loaded());
    }

    #[test]
    fn test_label_falls_back_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "v1", &spec(None), r#"{"a": 0}"#);
        let registry = ModelRegistry::new(dir.path(), "v1", MockLoader);
        let model = registry.load_model("v1").unwrap();

        assert_eq!(model.label(0), "a");
        assert_eq!(model.label(1), UNKNOWN_LABEL);
    }
}
