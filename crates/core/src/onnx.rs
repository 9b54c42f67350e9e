//! [`Transform`] backed by an ONNX Runtime session.
//!
//! Supports FP32 and FP16 models; FP16 inputs are converted on the way in and
//! outputs are widened back to f32 so the engine only ever sees f32 tensors.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, ArrayView4, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, SessionConfig};
use crate::patch::Transform;

/// Cloning shares the underlying session; concurrent callers serialize on it.
#[derive(Clone)]
pub struct OnnxTransform {
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxTransform {
    pub fn load(
        config: &SessionConfig<'_>,
        input_name: Option<String>,
        output_name: Option<String>,
    ) -> Result<Self> {
        let session = build_session(config)?;
        Self::from_session(session, input_name, output_name)
    }

    /// Wrap an existing session. IO names default to the model's first input
    /// and first output.
    pub fn from_session(
        session: Session,
        input_name: Option<String>,
        output_name: Option<String>,
    ) -> Result<Self> {
        let first_input = session.inputs().first().context("model declares no inputs")?;
        let input_name = input_name.unwrap_or_else(|| first_input.name().to_string());
        let output_name = match output_name {
            Some(name) => name,
            None => session
                .outputs()
                .first()
                .context("model declares no outputs")?
                .name()
                .to_string(),
        };
        let is_fp16 = match first_input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_name,
            is_fp16,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

impl Transform for OnnxTransform {
    fn apply(&mut self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let input = input.as_standard_layout().into_owned();
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;

        let output = if self.is_fp16 {
            run_fp16(&mut session, input, &self.input_name, &self.output_name)?
        } else {
            run_f32(&mut session, input, &self.input_name, &self.output_name)?
        };

        output
            .into_dimensionality::<Ix4>()
            .context("model output is not a 4-D NCHW tensor")
    }
}

fn run_f32(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let input_tensor = Tensor::from_array(input)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn run_fp16(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let shape = input.shape().to_vec();
    let f32_data = input.as_slice().context("FP32 input is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_data.len()];
    fp16_data.convert_from_f32_slice(f32_data);

    let input_tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let standard = output_view.as_standard_layout();
    let fp16_slice = standard
        .as_slice()
        .context("FP16 output is not contiguous")?;
    let mut widened = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut widened);

    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), widened)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;

    #[test]
    fn f16_conversion_is_close_for_unit_range() {
        let values = [0.0f32, 0.25, 0.5, 0.999, 1.0];
        let mut halves = vec![f16::ZERO; values.len()];
        halves.convert_from_f32_slice(&values);
        let mut back = vec![0.0f32; values.len()];
        halves.convert_to_f32_slice(&mut back);
        for (a, b) in values.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    /// Requires an ONNX model. Run: `cargo test -p swintile-core -- --ignored`
    #[test]
    #[ignore]
    fn onnx_transform_preserves_batch_and_channels() {
        let config = SessionConfig {
            model_path: std::path::Path::new("models/swinir_color_dn_noise15.onnx"),
            backend: &InferenceBackend::Cpu,
            trt_cache_dir: None,
        };
        let mut transform = OnnxTransform::load(&config, None, None).expect("load model");
        assert!(!transform.input_name().is_empty());
        assert!(!transform.output_name().is_empty());
        let input = Array4::<f32>::from_elem((1, 3, 64, 64), 0.5);
        let output = transform.apply(input.view()).expect("inference");
        assert_eq!(output.dim().0, 1);
        assert_eq!(output.dim().1, 3);
    }
}
