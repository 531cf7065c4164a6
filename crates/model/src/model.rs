use std::{collections::BTreeMap, path::Path};

use candle_core::{bail, DType, Device, Result, Tensor, Var, D};

use crate::{
    block::{padding_bias, EncoderBlock},
    config::EncoderConfig,
    embedding::Embeddings,
    heads::{HeadSpec, TaskHead},
    layers::dropout,
};

/// Output of [`MultiTaskNet::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `(batch, seq, classes)` for token heads, `(batch, classes)` for sequence heads, in `f32`.
    pub logits: Tensor,
    /// Labels on the model device as `u32`, shaped like `logits` without the class axis.
    pub labels: Tensor,
    /// Arg-max class per position, same shape as `labels`.
    pub predictions: Tensor,
}

/// Shared transformer encoder with one classification head per task.
pub struct MultiTaskNet {
    config: EncoderConfig,
    device: Device,
    embeddings: Embeddings,
    layers: Vec<EncoderBlock>,
    heads: BTreeMap<String, TaskHead>,
    finetuning: bool,
    training: bool,
    compute_dtype: DType,
}

impl MultiTaskNet {
    /// Builds the encoder and one head per entry of `heads`.
    ///
    /// With `finetuning == false` the encoder output is detached, so only the
    /// heads receive gradients.
    pub fn new(
        config: EncoderConfig,
        heads: &[HeadSpec],
        device: &Device,
        finetuning: bool,
    ) -> Result<Self> {
        config.validate()?;
        if heads.is_empty() {
            bail!("at least one task head is required");
        }

        let embeddings = Embeddings::new(&config, device)?;
        let distinct_layers = if config.share_layers { 1 } else { config.n_layers };
        let layers = (0..distinct_layers)
            .map(|_| EncoderBlock::new(&config, device))
            .collect::<Result<Vec<_>>>()?;

        let mut task_heads = BTreeMap::new();
        for spec in heads {
            let head = TaskHead::new(spec, config.hidden_dim, device)?;
            if task_heads.insert(spec.name.clone(), head).is_some() {
                bail!("duplicate task head '{}'", spec.name);
            }
        }

        let model = Self {
            config,
            device: device.clone(),
            embeddings,
            layers,
            heads: task_heads,
            finetuning,
            training: false,
            compute_dtype: DType::F32,
        };
        log::debug!(
            "built encoder with {} parameter tensors, {} head(s), finetuning={}",
            model.named_parameters().len(),
            model.heads.len(),
            finetuning
        );
        Ok(model)
    }

    /// Enables dropout when `true`; inference mode otherwise.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Runs the encoder in `dtype`; parameters stay in `f32`.
    pub fn set_compute_dtype(&mut self, dtype: DType) -> Result<()> {
        if !dtype.is_float() {
            bail!("compute dtype must be floating point, got {:?}", dtype);
        }
        self.compute_dtype = dtype;
        Ok(())
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.heads.keys().map(String::as_str).collect()
    }

    /// Contextual embeddings `(batch, seq, hidden)` for `(batch, seq)` token ids.
    pub fn encode(&self, input_ids: &Tensor) -> Result<Tensor> {
        let input_ids = input_ids.to_device(&self.device)?.to_dtype(DType::U32)?;
        let mask = input_ids.ne(self.config.pad_token_id)?;
        let bias = padding_bias(&mask)?;

        let embedded = self.embeddings.forward(&input_ids)?;
        let mut hidden =
            dropout(&embedded, self.config.dropout, self.training)?.to_dtype(self.compute_dtype)?;
        for index in 0..self.config.n_layers {
            let block = &self.layers[index % self.layers.len()];
            hidden = block.forward(&hidden, &bias, self.training)?;
        }

        if self.finetuning {
            Ok(hidden)
        } else {
            Ok(hidden.detach())
        }
    }

    /// Runs the encoder and `task`'s head.
    ///
    /// Fails when the task has no head or when `labels` does not match the
    /// head's output layout.
    pub fn forward(&self, input_ids: &Tensor, labels: &Tensor, task: &str) -> Result<ForwardOutput> {
        let Some(head) = self.heads.get(task) else {
            bail!(
                "no head for task '{}' (known: {})",
                task,
                self.task_names().join(", ")
            );
        };

        let encoded = self.encode(input_ids)?;
        let logits = head
            .forward(&encoded, self.config.dropout, self.training)?
            .to_dtype(DType::F32)?;

        let labels = labels.to_device(&self.device)?.to_dtype(DType::U32)?;
        let logit_dims = logits.dims();
        let expected = &logit_dims[..logit_dims.len() - 1];
        if labels.dims() != expected {
            bail!(
                "task '{}' produced logits {:?} but labels are {:?} (expected {:?})",
                task,
                logit_dims,
                labels.dims(),
                expected
            );
        }

        let predictions = logits.argmax(D::Minus1)?;
        Ok(ForwardOutput {
            logits,
            labels,
            predictions,
        })
    }

    /// Every parameter keyed by its dotted name, sorted by name.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.encoder_parameters();
        params.extend(self.head_parameters());
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Parameters that receive gradients: everything when fine-tuning, heads only otherwise.
    pub fn trainable_parameters(&self) -> Vec<(String, Var)> {
        if self.finetuning {
            self.named_parameters()
        } else {
            let mut params = self.head_parameters();
            params.sort_by(|a, b| a.0.cmp(&b.0));
            params
        }
    }

    fn encoder_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.embeddings.named_parameters("encoder.embeddings");
        for (index, block) in self.layers.iter().enumerate() {
            params.extend(block.named_parameters(&format!("encoder.layer.{index}")));
        }
        params
    }

    fn head_parameters(&self) -> Vec<(String, Var)> {
        self.heads
            .iter()
            .flat_map(|(name, head)| head.named_parameters(&format!("heads.{name}")))
            .collect()
    }

    /// Copies matching tensors from a safetensors file into the parameters.
    ///
    /// Parameters absent from the file keep their initial values (task heads
    /// usually are). Shape mismatches are errors. Returns how many tensors were
    /// loaded.
    pub fn load_weights(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &self.device)?;
        let mut loaded = 0usize;
        for (name, var) in self.named_parameters() {
            let Some(tensor) = tensors.remove(&name) else {
                log::debug!("{} has no tensor for '{}'", path.display(), name);
                continue;
            };
            if tensor.dims() != var.as_tensor().dims() {
                bail!(
                    "pretrained tensor '{}' has shape {:?}, model expects {:?}",
                    name,
                    tensor.dims(),
                    var.as_tensor().dims()
                );
            }
            var.set(&tensor.to_dtype(var.as_tensor().dtype())?)?;
            loaded += 1;
        }
        if !tensors.is_empty() {
            log::warn!(
                "{} unused tensor(s) in {}",
                tensors.len(),
                path.display()
            );
        }
        Ok(loaded)
    }
}
