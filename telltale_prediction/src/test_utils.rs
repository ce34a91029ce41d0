use crate::preprocess::InputSize;
use crate::registry::{Classifier, ModelError, ModelLoader, CLASS_MAP_FILE, MODEL_FILE};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::{fs, io::Cursor, path::Path};

/// Stand-in for an ONNX graph: the "model file" is this struct as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockModelSpec {
    pub input_size: Option<u32>,
    pub scores: Vec<f32>,
    #[serde(default)]
    pub fail: bool,
}

pub struct MockLoader;

impl ModelLoader for MockLoader {
    fn load(&self, model_file: &Path) -> Result<Box<dyn Classifier>, ModelError> {
        let raw = fs::read_to_string(model_file).map_err(|e| ModelError::Load(e.to_string()))?;
        let spec: MockModelSpec =
            serde_json::from_str(&raw).map_err(|e| ModelError::Load(e.to_string()))?;
        Ok(Box::new(MockClassifier { spec }))
    }
}

pub struct MockClassifier {
    spec: MockModelSpec,
}

impl Classifier for MockClassifier {
    fn input_size(&self) -> Option<InputSize> {
        self.spec.input_size.map(InputSize::square)
    }

    fn classify(&self, input: Array4<f32>) -> Result<Vec<f32>, ModelError> {
        if self.spec.fail {
            return Err(ModelError::Inference("mock failure".to_string()));
        }

        let side = self.input_size().unwrap_or_default();
        let expected = [1, side.height as usize, side.width as usize, 3];
        if input.shape() != &expected[..] {
            return Err(ModelError::Inference(format!(
                "unexpected input shape {:?}",
                input.shape()
            )));
        }
        Ok(self.spec.scores.clone())
    }
}

pub fn write_model(models_dir: &Path, name: &str, spec: &MockModelSpec, class_map: &str) {
    let dir = models_dir.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(MODEL_FILE), serde_json::to_string(spec).unwrap()).unwrap();
    fs::write(dir.join(CLASS_MAP_FILE), class_map).unwrap();
}

/// Dark square stroke on a transparent canvas, PNG encoded.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        if x > width / 3 && x < 2 * width / 3 && y > height / 3 && y < 2 * height / 3 {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });

    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}
