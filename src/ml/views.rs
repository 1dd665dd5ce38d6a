//! Lazy tensor views.
//!
//! A view holds shared handles to its source tensors and recomputes every value on read.
//! All shape checks happen when the view is built, so [`View::value`] never fails.

use std::rc::Rc;

use super::{Shape, Tensor};
use crate::error::{MlError, Result};

pub(crate) enum View {
    NoOp(Tensor),
    Transform {
        source: Tensor,
        function: Rc<dyn Fn(f32) -> f32>,
    },
    TransformWithConstants {
        source: Tensor,
        function: fn(f32, &[f64]) -> f32,
        constants: Vec<f64>,
    },
    Add(Tensor, Tensor),
    Subtract(Tensor, Tensor),
    Multiply(Tensor, Tensor),
    Scale {
        source: Tensor,
        factor: f32,
    },
    Transpose(Tensor),
    Reshape {
        source: Tensor,
        shape: Shape,
    },
    Dot(Tensor, Tensor),
    ValidCrossCorrelation2d {
        input: Tensor,
        kernel: Tensor,
    },
    FullConvolution2d {
        input: Tensor,
        kernel: Tensor,
    },
    ChannelToTensor {
        source: Tensor,
        channel: usize,
    },
    TensorToChannel {
        source: Tensor,
        channel: usize,
    },
    Diagonal(Tensor),
    Rounded(Tensor),
}

impl View {
    pub(crate) fn value(&self, row: usize, column: usize, channel: usize) -> f32 {
        match self {
            View::NoOp(source) => source.get_value(row, column, channel),
            View::Transform { source, function } => function(source.get_value(row, column, channel)),
            View::TransformWithConstants {
                source,
                function,
                constants,
            } => function(source.get_value(row, column, channel), constants),
            View::Add(a, b) => a.get_value(row, column, channel) + b.get_value(row, column, channel),
            View::Subtract(a, b) => {
                a.get_value(row, column, channel) - b.get_value(row, column, channel)
            }
            View::Multiply(a, b) => {
                a.get_value(row, column, channel) * b.get_value(row, column, channel)
            }
            View::Scale { source, factor } => source.get_value(row, column, channel) * factor,
            View::Transpose(source) => source.get_value(column, row, channel),
            View::Reshape { source, shape } => {
                source.get_flat(shape.flat_index(row, column, channel))
            }
            View::Dot(a, b) => (0..a.column_count())
                .map(|k| a.get_value(row, k, channel) * b.get_value(k, column, channel))
                .sum(),
            View::ValidCrossCorrelation2d { input, kernel } => {
                let summed = kernel.channel_count() > 1 || input.channel_count() == 1;
                let mut total = 0.0;
                for i in 0..kernel.row_count() {
                    for j in 0..kernel.column_count() {
                        if summed {
                            for ch in 0..kernel.channel_count() {
                                total += input.get_value(row + i, column + j, ch)
                                    * kernel.get_value(i, j, ch);
                            }
                        } else {
                            total += input.get_value(row + i, column + j, channel)
                                * kernel.get_value(i, j, 0);
                        }
                    }
                }
                total
            }
            View::FullConvolution2d { input, kernel } => {
                let input_channel = if input.channel_count() == 1 { 0 } else { channel };
                let mut total = 0.0;
                for i in 0..kernel.row_count() {
                    if i > row || row - i >= input.row_count() {
                        continue;
                    }
                    for j in 0..kernel.column_count() {
                        if j > column || column - j >= input.column_count() {
                            continue;
                        }
                        total += input.get_value(row - i, column - j, input_channel)
                            * kernel.get_value(i, j, channel);
                    }
                }
                total
            }
            View::ChannelToTensor { source, channel: selected } => {
                source.get_value(row, column, *selected)
            }
            View::TensorToChannel {
                source,
                channel: placed,
            } => {
                if channel == *placed {
                    source.get_value(row, column, 0)
                } else {
                    0.0
                }
            }
            View::Diagonal(source) => {
                if row == column {
                    source.get_flat(row)
                } else {
                    0.0
                }
            }
            View::Rounded(source) => source.get_value(row, column, channel).round(),
        }
    }
}

fn check_same_shape(operation: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(MlError::ShapeMismatch {
            operation,
            expected: a.shape(),
            actual: b.shape(),
        });
    }
    Ok(())
}

impl Tensor {
    /// Passthrough view that reads straight from `self`.
    pub fn no_op(&self) -> Tensor {
        Tensor::from_view(self.shape(), View::NoOp(self.clone()))
    }

    /// Apply `function` to every value.
    pub fn transform(&self, function: impl Fn(f32) -> f32 + 'static) -> Tensor {
        Tensor::from_view(
            self.shape(),
            View::Transform {
                source: self.clone(),
                function: Rc::new(function),
            },
        )
    }

    /// Apply `function` to every value together with a fixed set of constants.
    pub fn transform_with(&self, function: fn(f32, &[f64]) -> f32, constants: Vec<f64>) -> Tensor {
        Tensor::from_view(
            self.shape(),
            View::TransformWithConstants {
                source: self.clone(),
                function,
                constants,
            },
        )
    }

    pub fn add_tensor(&self, other: &Tensor) -> Result<Tensor> {
        check_same_shape("add", self, other)?;
        Ok(Tensor::from_view(
            self.shape(),
            View::Add(self.clone(), other.clone()),
        ))
    }

    pub fn subtract_tensor(&self, other: &Tensor) -> Result<Tensor> {
        check_same_shape("subtract", self, other)?;
        Ok(Tensor::from_view(
            self.shape(),
            View::Subtract(self.clone(), other.clone()),
        ))
    }

    /// Elementwise (Hadamard) product.
    pub fn multiply_tensor(&self, other: &Tensor) -> Result<Tensor> {
        check_same_shape("multiply", self, other)?;
        Ok(Tensor::from_view(
            self.shape(),
            View::Multiply(self.clone(), other.clone()),
        ))
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        Tensor::from_view(
            self.shape(),
            View::Scale {
                source: self.clone(),
                factor,
            },
        )
    }

    /// Swap the row and column axes.
    pub fn transpose(&self) -> Tensor {
        let shape = self.shape();
        Tensor::from_view(
            Shape::new(shape.columns, shape.rows, shape.channels),
            View::Transpose(self.clone()),
        )
    }

    /// Reinterpret the flat value sequence with new extents.
    pub fn reshape(&self, shape: Shape) -> Result<Tensor> {
        if shape.size() != self.size() {
            return Err(MlError::ShapeMismatch {
                operation: "reshape",
                expected: self.shape(),
                actual: shape,
            });
        }
        if shape == self.shape() {
            return Ok(self.no_op());
        }
        Ok(Tensor::from_view(
            shape,
            View::Reshape {
                source: self.clone(),
                shape,
            },
        ))
    }

    /// Matrix product per channel: `result[r][c] = Σ_k self[r][k] * other[k][c]`.
    pub fn dot(&self, other: &Tensor) -> Result<Tensor> {
        if self.column_count() != other.row_count() || self.channel_count() != other.channel_count()
        {
            return Err(MlError::ShapeMismatch {
                operation: "dot",
                expected: Shape::new(
                    self.column_count(),
                    other.column_count(),
                    self.channel_count(),
                ),
                actual: other.shape(),
            });
        }
        Ok(Tensor::from_view(
            Shape::new(self.row_count(), other.column_count(), self.channel_count()),
            View::Dot(self.clone(), other.clone()),
        ))
    }

    /// Sliding-window correlation without padding.
    ///
    /// A one-channel kernel is applied to every input channel separately. A kernel with as
    /// many channels as the input sums over channels into a single output channel.
    pub fn valid_cross_correlation_2d(&self, kernel: &Tensor) -> Result<Tensor> {
        let input = self.shape();
        let k = kernel.shape();
        let channels_match = k.channels == 1 || k.channels == input.channels;
        if !channels_match || k.rows > input.rows || k.columns > input.columns || k.size() == 0 {
            return Err(MlError::ShapeMismatch {
                operation: "valid_cross_correlation_2d",
                expected: Shape::new(input.rows, input.columns, input.channels),
                actual: k,
            });
        }
        let channels = if k.channels == 1 { input.channels } else { 1 };
        Ok(Tensor::from_view(
            Shape::new(input.rows - k.rows + 1, input.columns - k.columns + 1, channels),
            View::ValidCrossCorrelation2d {
                input: self.clone(),
                kernel: kernel.clone(),
            },
        ))
    }

    /// Sliding-window convolution with full padding; undoes the shrink of
    /// [`Tensor::valid_cross_correlation_2d`]. Produces one channel per kernel channel.
    pub fn full_convolution_2d(&self, kernel: &Tensor) -> Result<Tensor> {
        let input = self.shape();
        let k = kernel.shape();
        if input.channels != 1 && input.channels != k.channels {
            return Err(MlError::ShapeMismatch {
                operation: "full_convolution_2d",
                expected: Shape::new(input.rows, input.columns, k.channels),
                actual: input,
            });
        }
        Ok(Tensor::from_view(
            Shape::new(
                input.rows + k.rows.saturating_sub(1),
                input.columns + k.columns.saturating_sub(1),
                k.channels,
            ),
            View::FullConvolution2d {
                input: self.clone(),
                kernel: kernel.clone(),
            },
        ))
    }

    /// One channel as a standalone single-channel tensor.
    pub fn channel(&self, channel: usize) -> Result<Tensor> {
        if channel >= self.channel_count() {
            return Err(MlError::InvalidArgument(format!(
                "channel {channel} out of range for {}",
                self.shape()
            )));
        }
        Ok(Tensor::from_view(
            Shape::new(self.row_count(), self.column_count(), 1),
            View::ChannelToTensor {
                source: self.clone(),
                channel,
            },
        ))
    }

    /// Place a single-channel tensor at `channel` of a `channels`-wide tensor, zero elsewhere.
    pub fn to_channel(&self, channel: usize, channels: usize) -> Result<Tensor> {
        if self.channel_count() != 1 {
            return Err(MlError::UnsupportedShape {
                operation: "to_channel",
                shape: self.shape(),
            });
        }
        if channel >= channels {
            return Err(MlError::InvalidArgument(format!(
                "channel {channel} out of range for {channels} channels"
            )));
        }
        Ok(Tensor::from_view(
            Shape::new(self.row_count(), self.column_count(), channels),
            View::TensorToChannel {
                source: self.clone(),
                channel,
            },
        ))
    }

    /// Square matrix with this vector on its diagonal.
    pub fn diagonal(&self) -> Result<Tensor> {
        if !self.shape().is_vector() {
            return Err(MlError::UnsupportedShape {
                operation: "diagonal",
                shape: self.shape(),
            });
        }
        let n = self.size();
        Ok(Tensor::from_view(
            Shape::new(n, n, 1),
            View::Diagonal(self.clone()),
        ))
    }

    /// Round every value to the nearest integer.
    pub fn rounded(&self) -> Tensor {
        Tensor::from_view(self.shape(), View::Rounded(self.clone()))
    }
}
