use std::collections::VecDeque;

use super::{
    average_buffered, layer_output, single_input, Bits, NetworkFunction, Shape, Tensor,
};
use crate::error::{MlError, Result};

/// Activation applied to a whole tensor.
///
/// `activate` and `derivative` return lazy views over `input`. `input_error` applies the
/// chain rule against the error of the activation's output.
pub trait ActivationFunction {
    fn activate(&self, input: &Tensor) -> Result<Tensor>;
    fn derivative(&self, input: &Tensor) -> Result<Tensor>;
    fn input_error(&self, input: &Tensor, output_error: &Tensor) -> Result<Tensor> {
        self.derivative(input)?.multiply_tensor(output_error)
    }
}

/// Activation defined value by value.
pub trait SingleShoot {
    fn single_forward(&self, x: f32) -> f32;
    fn single_backward(&self, x: f32) -> f32;
}

impl<F: SingleShoot + Clone + 'static> ActivationFunction for F {
    fn activate(&self, input: &Tensor) -> Result<Tensor> {
        let function = self.clone();
        Ok(input.transform(move |x| function.single_forward(x)))
    }
    fn derivative(&self, input: &Tensor) -> Result<Tensor> {
        let function = self.clone();
        Ok(input.transform(move |x| function.single_backward(x)))
    }
}

/// Identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct Linear;

impl ActivationFunction for Linear {
    fn activate(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.no_op())
    }
    fn derivative(&self, input: &Tensor) -> Result<Tensor> {
        Ok(Tensor::ones(input.shape()))
    }
    fn input_error(&self, input: &Tensor, output_error: &Tensor) -> Result<Tensor> {
        if input.shape() != output_error.shape() {
            return Err(MlError::ShapeMismatch {
                operation: "Linear.input_error",
                expected: input.shape(),
                actual: output_error.shape(),
            });
        }
        Ok(output_error.clone())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Relu;

impl SingleShoot for Relu {
    fn single_forward(&self, x: f32) -> f32 {
        x.max(0.0)
    }
    // undefined at 0, treated as flat
    fn single_backward(&self, x: f32) -> f32 {
        if x > 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LeakyRelu {
    alpha: f32,
}

impl LeakyRelu {
    pub fn new(alpha: f32) -> Self {
        LeakyRelu { alpha }
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        LeakyRelu::new(0.01)
    }
}

impl SingleShoot for LeakyRelu {
    fn single_forward(&self, x: f32) -> f32 {
        if x < 0.0 {
            self.alpha * x
        } else {
            x
        }
    }
    fn single_backward(&self, x: f32) -> f32 {
        if x < 0.0 {
            self.alpha
        } else {
            1.0
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sigmoid;

impl SingleShoot for Sigmoid {
    fn single_forward(&self, x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }
    fn single_backward(&self, x: f32) -> f32 {
        let s = self.single_forward(x);
        s * (1.0 - s)
    }
}

/// Rational approximation of sigmoid, `0.5 * (x / (1 + |x|) + 1)`. Avoids `exp()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SigmoidApproximation;

impl SingleShoot for SigmoidApproximation {
    fn single_forward(&self, x: f32) -> f32 {
        0.5 * (x / (1.0 + x.abs()) + 1.0)
    }
    // sigmoid's s * (1 - s) identity, applied to the approximation
    fn single_backward(&self, x: f32) -> f32 {
        let s = self.single_forward(x);
        s * (1.0 - s)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Tanh;

impl SingleShoot for Tanh {
    fn single_forward(&self, x: f32) -> f32 {
        x.tanh()
    }
    fn single_backward(&self, x: f32) -> f32 {
        let th = x.tanh();
        1.0 - th * th
    }
}

/// `tanh(x) = 2 * sigmoid(2x) - 1`
#[derive(Clone, Copy, Debug, Default)]
pub struct TanhApproximation;

impl SingleShoot for TanhApproximation {
    fn single_forward(&self, x: f32) -> f32 {
        2.0 / (1.0 + (-2.0 * x).exp()) - 1.0
    }
    fn single_backward(&self, x: f32) -> f32 {
        let th = self.single_forward(x);
        1.0 - th * th
    }
}

/// Normalized exponentials of a single row or single column.
#[derive(Clone, Copy, Debug, Default)]
pub struct Softmax;

impl Softmax {
    fn check_shape(input: &Tensor) -> Result<usize> {
        if !input.shape().is_vector() || input.size() == 0 {
            return Err(MlError::UnsupportedShape {
                operation: "Softmax",
                shape: input.shape(),
            });
        }
        Ok(input.size())
    }

    /// Jacobian `diag(s) - s * s^T` of the softmax output `s`.
    fn jacobian(&self, input: &Tensor) -> Result<Tensor> {
        let n = Self::check_shape(input)?;
        let output = self.activate(input)?.materialize(Bits::F32);
        let column = output.reshape(Shape::column(n))?;
        let row = output.reshape(Shape::row(n))?;
        output.diagonal()?.subtract_tensor(&column.dot(&row)?)
    }
}

impl ActivationFunction for Softmax {
    fn activate(&self, input: &Tensor) -> Result<Tensor> {
        let n = Self::check_shape(input)?;
        let (_, largest) = input.range();
        let sum: f64 = (0..n)
            .map(|i| ((input.get_flat(i) - largest) as f64).exp())
            .sum();
        Ok(input.transform_with(
            |x, constants| ((x as f64 - constants[0]).exp() / constants[1]) as f32,
            vec![largest as f64, sum],
        ))
    }

    fn derivative(&self, input: &Tensor) -> Result<Tensor> {
        self.jacobian(input)
    }

    fn input_error(&self, input: &Tensor, output_error: &Tensor) -> Result<Tensor> {
        let n = Self::check_shape(input)?;
        if output_error.size() != n {
            return Err(MlError::ShapeMismatch {
                operation: "Softmax.input_error",
                expected: input.shape(),
                actual: output_error.shape(),
            });
        }
        // the jacobian is symmetric, so g^T * J == (J * g)^T
        output_error
            .reshape(Shape::row(n))?
            .dot(&self.jacobian(input)?)?
            .reshape(input.shape())
    }
}

/// Activations available to the model builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivationType {
    Linear,
    Relu,
    LeakyRelu,
    Sigmoid,
    SigmoidApproximation,
    Tanh,
    TanhApproximation,
    Softmax,
}

impl ActivationType {
    pub fn create(self) -> Box<dyn ActivationFunction> {
        match self {
            ActivationType::Linear => Box::new(Linear),
            ActivationType::Relu => Box::new(Relu),
            ActivationType::LeakyRelu => Box::new(LeakyRelu::default()),
            ActivationType::Sigmoid => Box::new(Sigmoid),
            ActivationType::SigmoidApproximation => Box::new(SigmoidApproximation),
            ActivationType::Tanh => Box::new(Tanh),
            ActivationType::TanhApproximation => Box::new(TanhApproximation),
            ActivationType::Softmax => Box::new(Softmax),
        }
    }
}

/// Graph function wrapping an [`ActivationFunction`].
///
/// Inputs seen while training are buffered; `backward` applies the derivative at their mean.
pub struct ActivationLayer {
    function: Box<dyn ActivationFunction>,
    inputs: VecDeque<Tensor>,
    materialized: bool,
}

impl ActivationLayer {
    pub fn new(function: Box<dyn ActivationFunction>) -> Self {
        ActivationLayer {
            function,
            inputs: VecDeque::new(),
            materialized: true,
        }
    }

    pub fn of(activation: ActivationType) -> Self {
        Self::new(activation.create())
    }
}

impl NetworkFunction for ActivationLayer {
    fn forward(&mut self, inputs: &[Tensor], training: bool) -> Result<Tensor> {
        let input = single_input(inputs, "ActivationLayer")?;
        if training {
            self.inputs.push_back(input.clone());
        }
        Ok(layer_output(self.function.activate(input)?, self.materialized))
    }

    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        let input = average_buffered(&mut self.inputs, "ActivationLayer")?;
        Ok(self
            .function
            .input_error(&input, output_error)?
            .materialize(Bits::F32))
    }

    fn set_materialized(&mut self, materialized: bool) {
        self.materialized = materialized;
    }
}

/// Compares a network output with its expected value.
pub trait LossFunction {
    /// Scalar summary for logging.
    fn compute_total_for_display(&self, expected: &Tensor, actual: &Tensor) -> Result<f32>;
    /// Error of `actual`, same shape as `actual`. Seeds the backward pass.
    fn partial_derivative(&self, expected: &Tensor, actual: &Tensor) -> Result<Tensor>;
}

fn check_loss_shapes(operation: &'static str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.shape() != actual.shape() {
        return Err(MlError::ShapeMismatch {
            operation,
            expected: expected.shape(),
            actual: actual.shape(),
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MeanSquaredError;

impl LossFunction for MeanSquaredError {
    fn compute_total_for_display(&self, expected: &Tensor, actual: &Tensor) -> Result<f32> {
        check_loss_shapes("MeanSquaredError", expected, actual)?;
        if actual.size() == 0 {
            return Ok(0.0);
        }
        let total: f32 = (0..actual.size())
            .map(|i| (actual.get_flat(i) - expected.get_flat(i)).powi(2))
            .sum();
        Ok(total / actual.size() as f32)
    }

    fn partial_derivative(&self, expected: &Tensor, actual: &Tensor) -> Result<Tensor> {
        check_loss_shapes("MeanSquaredError", expected, actual)?;
        let n = actual.size().max(1) as f32;
        Ok(actual.subtract_tensor(expected)?.scale(2.0 / n))
    }
}

/// Cross entropy against one-hot expectations, for softmax outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct CategoricalCrossEntropy;

impl CategoricalCrossEntropy {
    const EPSILON: f32 = 1e-7;
}

impl LossFunction for CategoricalCrossEntropy {
    fn compute_total_for_display(&self, expected: &Tensor, actual: &Tensor) -> Result<f32> {
        check_loss_shapes("CategoricalCrossEntropy", expected, actual)?;
        let total: f32 = (0..actual.size())
            .map(|i| -expected.get_flat(i) * (actual.get_flat(i) + Self::EPSILON).ln())
            .sum();
        Ok(total)
    }

    fn partial_derivative(&self, expected: &Tensor, actual: &Tensor) -> Result<Tensor> {
        check_loss_shapes("CategoricalCrossEntropy", expected, actual)?;
        let values = (0..actual.size())
            .map(|i| -expected.get_flat(i) / (actual.get_flat(i) + Self::EPSILON))
            .collect();
        Tensor::new(values, actual.shape())
    }
}
