pub mod scaler;

pub use scaler::{GradientScaler, LossScaleConfig, MixedPrecision, ScaledGradients};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::config::{to_runtime_error, FinetuneError, OptimizerConfig};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl AdamWConfig {
    pub fn from_run(learning_rate: f64, config: &OptimizerConfig) -> Self {
        Self {
            learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            weight_decay: config.weight_decay,
        }
    }
}

/// AdamW over a fixed set of named parameters.
///
/// Moments are kept in `f32` whatever the parameter dtype.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
    ) -> Result<Self, FinetuneError> {
        if named_parameters.is_empty() {
            return Err(FinetuneError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(FinetuneError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment =
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)?;
            let dtype = tensor.dtype();

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                first_moment,
                second_moment,
            });
        }

        log::debug!("optimizer tracks {} parameter tensors", params.len());
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.params.iter().map(|slot| slot.param.as_tensor())
    }

    /// Applies one AdamW update from `grads`, consuming the gradients it uses.
    ///
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), FinetuneError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                log::trace!("no gradient for '{}'", slot.name);
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((index, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + grad
                    .sqr()
                    .map_err(to_runtime_error)?
                    .affine(1.0 - cfg.beta2, 0.0)
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any gradient held for the tracked parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}
