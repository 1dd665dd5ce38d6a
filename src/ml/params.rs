use std::collections::VecDeque;
use std::path::Path;

use tracing::debug;

use super::binary_io::{
    load_tensors, save_tensors, TYPE_BIAS, TYPE_CONVOLUTION_2D, TYPE_FULLY_CONNECTED,
};
use super::optim::{MixedPrecisionScale, SharedLearningState};
use super::{
    average_buffered, layer_output, single_input, Bits, NetworkFunction, Shape, Tensor,
};
use crate::error::{MlError, Result};
use crate::utills::random_tensor;

const INITIAL_WEIGHT_MIN: f32 = -0.5;
const INITIAL_WEIGHT_MAX: f32 = 0.5;

/// Replace `current` with loaded tensors of identical shapes.
fn replace_checked(current: &[Tensor], loaded: Vec<Tensor>, layer: &str) -> Result<Vec<Tensor>> {
    if loaded.len() != current.len() {
        return Err(MlError::InvalidFormat(format!(
            "{layer} expects {} tensors, file holds {}",
            current.len(),
            loaded.len()
        )));
    }
    for (old, new) in current.iter().zip(&loaded) {
        if old.shape() != new.shape() {
            return Err(MlError::ShapeMismatch {
                operation: "load_param",
                expected: old.shape(),
                actual: new.shape(),
            });
        }
    }
    Ok(loaded)
}

/// `weights - gradient * rate`, stored at `bits`.
fn descend(weights: &Tensor, gradient: &Tensor, rate: f32, bits: Bits) -> Result<Tensor> {
    Ok(weights
        .subtract_tensor(&gradient.scale(rate))?
        .materialize(bits))
}

/// Dense layer: `output = input · weights` with weights of shape `input_size x output_size`.
pub struct FullyConnected {
    weights: Tensor,
    inputs: VecDeque<Tensor>,
    bits: Bits,
    scale: f32,
    materialized: bool,
    state: SharedLearningState,
}

impl FullyConnected {
    pub fn new(
        input_size: usize,
        output_size: usize,
        bits: Bits,
        state: SharedLearningState,
        seed: u64,
    ) -> Result<Self> {
        let weights = random_tensor(
            Shape::new(input_size, output_size, 1),
            INITIAL_WEIGHT_MIN,
            INITIAL_WEIGHT_MAX,
            seed,
        )?;
        Ok(Self::with_weights(weights, bits, state))
    }

    pub fn with_weights(weights: Tensor, bits: Bits, state: SharedLearningState) -> Self {
        FullyConnected {
            weights: weights.materialize(bits),
            inputs: VecDeque::new(),
            bits,
            scale: MixedPrecisionScale::weights(bits),
            materialized: true,
            state,
        }
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }
}

impl NetworkFunction for FullyConnected {
    fn forward(&mut self, inputs: &[Tensor], training: bool) -> Result<Tensor> {
        let input = single_input(inputs, "FullyConnected")?;
        let output = layer_output(input.dot(&self.weights)?, self.materialized);
        if training {
            self.inputs.push_back(input.clone());
        }
        Ok(output)
    }

    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        let input = average_buffered(&mut self.inputs, "FullyConnected")?;

        let input_error = output_error
            .dot(&self.weights.transpose())?
            .materialize(Bits::F32);

        let gradient = input.transpose().dot(output_error)?;
        let rate = self.state.get().learning_rate * self.scale;
        self.weights = descend(&self.weights, &gradient, rate, self.bits)?;
        debug!(shape = %self.weights.shape(), rate, "updated fully connected weights");

        Ok(input_error)
    }

    fn has_params(&self) -> bool {
        true
    }

    fn set_materialized(&mut self, materialized: bool) {
        self.materialized = materialized;
    }

    fn save_param(&self, path: &Path) -> Result<()> {
        save_tensors(
            path,
            TYPE_FULLY_CONNECTED,
            std::slice::from_ref(&self.weights),
            self.bits,
        )
    }

    fn load_param(&mut self, path: &Path) -> Result<()> {
        let loaded = load_tensors(path, TYPE_FULLY_CONNECTED)?;
        let mut loaded = replace_checked(std::slice::from_ref(&self.weights), loaded, "FullyConnected")?;
        if let Some(weights) = loaded.pop() {
            self.weights = weights;
        }
        Ok(())
    }
}

/// Adds a learned bias, initialized to zero, to its input.
pub struct Bias {
    bias: Tensor,
    batch_size: usize,
    bits: Bits,
    materialized: bool,
    state: SharedLearningState,
}

impl Bias {
    pub fn new(shape: Shape, bits: Bits, state: SharedLearningState) -> Self {
        Bias {
            bias: Tensor::zeros(shape),
            batch_size: 0,
            bits,
            materialized: true,
            state,
        }
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl NetworkFunction for Bias {
    fn forward(&mut self, inputs: &[Tensor], training: bool) -> Result<Tensor> {
        let input = single_input(inputs, "Bias")?;
        let output = layer_output(input.add_tensor(&self.bias)?, self.materialized);
        if training {
            self.batch_size += 1;
        }
        Ok(output)
    }

    /// The bias derivative is the identity, so `output_error` is returned unchanged.
    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        if self.batch_size == 0 {
            return Err(MlError::MissingInput(
                "Bias.backward() called without previous inputs".to_string(),
            ));
        }
        let state = self.state.get();
        let scale = MixedPrecisionScale::bias(self.bits, state.learning_rate);
        let rate = state.bias_learning_rate * scale / self.batch_size as f32;
        self.bias = descend(&self.bias, output_error, rate, self.bits)?;
        self.batch_size = 0;
        debug!(shape = %self.bias.shape(), rate, "updated bias");
        Ok(output_error.clone())
    }

    fn has_params(&self) -> bool {
        true
    }

    fn set_materialized(&mut self, materialized: bool) {
        self.materialized = materialized;
    }

    fn save_param(&self, path: &Path) -> Result<()> {
        save_tensors(path, TYPE_BIAS, std::slice::from_ref(&self.bias), self.bits)
    }

    fn load_param(&mut self, path: &Path) -> Result<()> {
        let loaded = load_tensors(path, TYPE_BIAS)?;
        let mut loaded = replace_checked(std::slice::from_ref(&self.bias), loaded, "Bias")?;
        if let Some(bias) = loaded.pop() {
            self.bias = bias;
        }
        Ok(())
    }
}

/// 2-D convolution with one `kernel x kernel x input channels` weight tensor per filter.
///
/// Output channel `f` is the valid cross-correlation of the input with filter `f`.
pub struct Convolution2d {
    weights: Vec<Tensor>,
    inputs: VecDeque<Tensor>,
    input_shape: Shape,
    bits: Bits,
    scale: f32,
    materialized: bool,
    state: SharedLearningState,
}

impl Convolution2d {
    /// Filter `f` is initialized from `seed + f`.
    pub fn new(
        input_shape: Shape,
        filters: usize,
        kernel_size: usize,
        bits: Bits,
        state: SharedLearningState,
        seed: u64,
    ) -> Result<Self> {
        if filters == 0 {
            return Err(MlError::InvalidArgument(
                "Convolution2d needs at least one filter".to_string(),
            ));
        }
        if kernel_size == 0 || kernel_size > input_shape.rows || kernel_size > input_shape.columns
        {
            return Err(MlError::InvalidArgument(format!(
                "kernel size {kernel_size} does not fit input {input_shape}"
            )));
        }
        let kernel_shape = Shape::new(kernel_size, kernel_size, input_shape.channels);
        let weights = (0..filters)
            .map(|filter| {
                random_tensor(
                    kernel_shape,
                    INITIAL_WEIGHT_MIN,
                    INITIAL_WEIGHT_MAX,
                    seed.wrapping_add(filter as u64),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_weights(input_shape, weights, bits, state))
    }

    pub fn with_weights(
        input_shape: Shape,
        weights: Vec<Tensor>,
        bits: Bits,
        state: SharedLearningState,
    ) -> Self {
        Convolution2d {
            weights: weights.iter().map(|w| w.materialize(bits)).collect(),
            inputs: VecDeque::new(),
            input_shape,
            bits,
            scale: MixedPrecisionScale::weights(bits),
            materialized: true,
            state,
        }
    }

    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    pub fn output_shape(&self) -> Shape {
        let kernel = self.weights.first().map_or(Shape::new(1, 1, 1), |w| w.shape());
        Shape::new(
            self.input_shape.rows + 1 - kernel.rows,
            self.input_shape.columns + 1 - kernel.columns,
            self.weights.len(),
        )
    }
}

impl NetworkFunction for Convolution2d {
    fn forward(&mut self, inputs: &[Tensor], training: bool) -> Result<Tensor> {
        let input = single_input(inputs, "Convolution2d")?;
        let filters = self.weights.len();
        let mut result: Option<Tensor> = None;
        for (filter, kernel) in self.weights.iter().enumerate() {
            let placed = input
                .valid_cross_correlation_2d(kernel)?
                .to_channel(filter, filters)?;
            result = Some(match result {
                Some(sum) => sum.add_tensor(&placed)?,
                None => placed,
            });
        }
        let output = result
            .ok_or_else(|| MlError::InvalidArgument("Convolution2d has no filters".to_string()))?;
        let output = layer_output(output, self.materialized);
        if training {
            self.inputs.push_back(input.clone());
        }
        Ok(output)
    }

    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        let input = average_buffered(&mut self.inputs, "Convolution2d")?;
        let rate = self.state.get().learning_rate * self.scale;

        let mut input_error: Option<Tensor> = None;
        for filter in 0..self.weights.len() {
            let error_channel = output_error.channel(filter)?.materialize(Bits::F32);
            let contribution = error_channel.full_convolution_2d(&self.weights[filter])?;
            if contribution.shape() != input.shape() {
                return Err(MlError::ShapeMismatch {
                    operation: "Convolution2d.backward",
                    expected: input.shape(),
                    actual: contribution.shape(),
                });
            }
            input_error = Some(match input_error {
                Some(sum) => sum.add_tensor(&contribution)?,
                None => contribution,
            });

            let gradient = input.valid_cross_correlation_2d(&error_channel)?;
            self.weights[filter] = descend(&self.weights[filter], &gradient, rate, self.bits)?;
        }
        debug!(filters = self.weights.len(), rate, "updated convolution weights");

        let input_error = input_error
            .ok_or_else(|| MlError::InvalidArgument("Convolution2d has no filters".to_string()))?
            .materialize(Bits::F32);
        Ok(input_error)
    }

    fn has_params(&self) -> bool {
        true
    }

    fn set_materialized(&mut self, materialized: bool) {
        self.materialized = materialized;
    }

    fn save_param(&self, path: &Path) -> Result<()> {
        save_tensors(path, TYPE_CONVOLUTION_2D, &self.weights, self.bits)
    }

    fn load_param(&mut self, path: &Path) -> Result<()> {
        let loaded = load_tensors(path, TYPE_CONVOLUTION_2D)?;
        self.weights = replace_checked(&self.weights, loaded, "Convolution2d")?;
        Ok(())
    }
}
