use std::cell::Cell;
use std::rc::Rc;

use super::params::{Bias, Convolution2d, FullyConnected};
use super::{Bits, NetworkFunction, Optimizer, Shape};
use crate::error::Result;

pub const DEFAULT_SEED: u64 = 42;

/// Mini-batch gradient descent settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MbgdConfig {
    pub learning_rate: f32,
    pub bias_learning_rate: f32,
    /// Seed for weight initialization.
    pub seed: u64,
}

impl MbgdConfig {
    /// Bias learns at a tenth of `learning_rate`.
    pub fn new(learning_rate: f32) -> Self {
        MbgdConfig {
            learning_rate,
            bias_learning_rate: learning_rate * 0.1,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_bias_learning_rate(mut self, bias_learning_rate: f32) -> Self {
        self.bias_learning_rate = bias_learning_rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MbgdLearningState {
    pub learning_rate: f32,
    pub bias_learning_rate: f32,
}

/// Learning rates shared between an optimizer and every layer it created.
pub type SharedLearningState = Rc<Cell<MbgdLearningState>>;

/// Multipliers applied to learning-rate updates per bit width.
///
/// Narrow formats lose small updates to rounding, so their updates are scaled up.
pub struct MixedPrecisionScale;

impl MixedPrecisionScale {
    pub fn weights(bits: Bits) -> f32 {
        match bits {
            Bits::F32 => 0.5,
            Bits::F16 => 2.0,
            Bits::Quarter => 3.0,
        }
    }

    pub fn bias(bits: Bits, learning_rate: f32) -> f32 {
        match bits {
            Bits::F32 => 0.1,
            Bits::F16 if learning_rate < 0.45 => 2.0,
            Bits::Quarter if learning_rate < 0.3 => 3.0,
            Bits::F16 | Bits::Quarter => 1.0,
        }
    }
}

/// Creates fully-connected, bias and convolution layers that update themselves with
/// mini-batch gradient descent.
pub struct MbgdOptimizer {
    state: SharedLearningState,
    seed: u64,
}

impl MbgdOptimizer {
    pub fn new(config: MbgdConfig) -> Self {
        MbgdOptimizer {
            state: Rc::new(Cell::new(MbgdLearningState {
                learning_rate: config.learning_rate,
                bias_learning_rate: config.bias_learning_rate,
            })),
            seed: config.seed,
        }
    }

    pub fn learning_state(&self) -> MbgdLearningState {
        self.state.get()
    }

    /// Change the rates of every layer created by this optimizer.
    pub fn set_learning_rates(&self, learning_rate: f32, bias_learning_rate: f32) {
        self.state.set(MbgdLearningState {
            learning_rate,
            bias_learning_rate,
        });
    }
}

impl Optimizer for MbgdOptimizer {
    fn create_fully_connected(
        &self,
        input_size: usize,
        output_size: usize,
        bits: Bits,
    ) -> Result<Box<dyn NetworkFunction>> {
        Ok(Box::new(FullyConnected::new(
            input_size,
            output_size,
            bits,
            self.state.clone(),
            self.seed,
        )?))
    }

    fn create_bias(&self, shape: Shape, bits: Bits) -> Result<Box<dyn NetworkFunction>> {
        Ok(Box::new(Bias::new(shape, bits, self.state.clone())))
    }

    fn create_convolution_2d(
        &self,
        input_shape: Shape,
        filters: usize,
        kernel_size: usize,
        bits: Bits,
    ) -> Result<Box<dyn NetworkFunction>> {
        Ok(Box::new(Convolution2d::new(
            input_shape,
            filters,
            kernel_size,
            bits,
            self.state.clone(),
            self.seed,
        )?))
    }
}
