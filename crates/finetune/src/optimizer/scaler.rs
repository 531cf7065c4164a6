use candle_core::{backprop::GradStore, DType, Tensor};

use super::TrainerOptimizer;
use crate::config::{to_runtime_error, FinetuneError, Precision};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Dynamic loss scaling for half-precision training.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision == Precision::Fp32 {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let cfg = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: cfg.initial_scale,
                stable_steps: 0,
                config: cfg,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, FinetuneError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, FinetuneError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(1.0 / state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, FinetuneError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        match &self.state {
            ScalerState::Disabled => Ok(false),
            ScalerState::Enabled(_) => {
                for tensor in tensors {
                    if contains_non_finite(tensor.as_ref())? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }
}

/// Gradients produced by [`MixedPrecision::backward`], already unscaled.
pub struct ScaledGradients {
    pub grads: GradStore,
    pub found_inf: bool,
}

/// Half-precision forward with a scaled backward pass.
///
/// The model runs in [`MixedPrecision::compute_dtype`] while parameters and
/// optimizer state stay in `f32`.
#[derive(Debug, Clone)]
pub struct MixedPrecision {
    compute_dtype: DType,
    scaler: GradientScaler,
}

impl MixedPrecision {
    pub fn fp16() -> Self {
        Self::with_config(LossScaleConfig::default())
    }

    pub fn with_config(config: LossScaleConfig) -> Self {
        Self {
            compute_dtype: DType::F16,
            scaler: GradientScaler::with_config(config, Precision::Fp16),
        }
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.loss_scale()
    }

    /// Backpropagates `loss * scale` and divides the gradients of `params` back down.
    pub fn backward<'a, I>(&self, loss: &Tensor, params: I) -> Result<ScaledGradients, FinetuneError>
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        let scaled = self.scaler.scale(loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;
        let mut found_inf = false;
        for param in params {
            let Some(grad) = grads.remove(param) else {
                continue;
            };
            let grad = self
                .scaler
                .unscale(&grad.to_dtype(DType::F32).map_err(to_runtime_error)?)?;
            if !found_inf && self.scaler.has_overflow([&grad])? {
                found_inf = true;
            }
            grads.insert(param, grad);
        }
        Ok(ScaledGradients { grads, found_inf })
    }

    /// Steps the optimizer unless the gradients overflowed, then adjusts the scale.
    ///
    /// Returns whether an update was applied.
    pub fn step(
        &mut self,
        optimizer: &mut TrainerOptimizer,
        mut scaled: ScaledGradients,
    ) -> Result<bool, FinetuneError> {
        self.scaler.update(scaled.found_inf);
        if scaled.found_inf {
            optimizer.zero_grad(&mut scaled.grads);
            log::warn!(
                "skipping optimizer step after gradient overflow, loss scale now {}",
                self.scaler.loss_scale()
            );
            return Ok(false);
        }
        optimizer.step(&mut scaled.grads)?;
        Ok(true)
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, FinetuneError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::AdamWConfig;
    use candle_core::{Device, Tensor, Var};

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        assert!(scaler.is_enabled());
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_infinite() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn detects_non_finite_gradients() {
        let scaler = GradientScaler::new(Precision::Fp16);
        assert!(!scaler.has_overflow([&tensor_from(&[1.0, -3.0])]).unwrap());
        assert!(scaler.has_overflow([&tensor_from(&[f32::INFINITY])]).unwrap());
    }

    #[test]
    fn no_op_for_fp32() {
        let scaler = GradientScaler::new(Precision::Fp32);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);

        let tensor = tensor_from(&[2.0, 4.0]);
        assert_eq!(
            scaler.scale(&tensor).unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 4.0]
        );
    }

    #[test]
    fn backward_returns_unscaled_gradients() {
        let var = Var::from_slice(&[1.0f32, 2.0], (2,), &Device::Cpu).unwrap();
        let precision = MixedPrecision::with_config(LossScaleConfig {
            initial_scale: 8.0,
            ..LossScaleConfig::default()
        });
        let loss = var.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();

        let scaled = precision.backward(&loss, [var.as_tensor()]).unwrap();
        assert!(!scaled.found_inf);
        let grad = scaled.grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![3.0, 3.0]);
    }

    #[test]
    fn overflowing_step_is_skipped() {
        let var = Var::from_slice(&[1.0f32], (1,), &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            AdamWConfig::from_run(0.1, &Default::default()),
        )
        .unwrap();
        let mut precision = MixedPrecision::with_config(LossScaleConfig {
            initial_scale: 1024.0,
            ..LossScaleConfig::default()
        });

        let mut grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
        grads.insert(var.as_tensor(), tensor_from(&[f32::INFINITY]));
        let applied = precision
            .step(
                &mut optimizer,
                ScaledGradients {
                    grads,
                    found_inf: true,
                },
            )
            .unwrap();

        assert!(!applied);
        assert_eq!(optimizer.steps(), 0);
        assert_eq!(precision.loss_scale(), 512.0);
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
    }
}
