/// Tensor persistence.
pub mod binary_io;
/// Sequential model-building DSL over the graph.
pub mod builder;
/// Activation functions, the activation layer and loss functions.
pub mod funcs;
/// Node/connection DAG with forward and backward traversal.
pub mod graph;
/// Logging utilities for training (requires `logging` feature).
#[cfg(feature = "logging")]
pub mod logger;
/// Metrics for model evaluation.
pub mod metrics;
/// Parameter-free structural functions.
pub mod ops;
/// Mini-batch gradient descent optimizer.
pub mod optim;
/// Trainable layers owning weight and bias tensors.
pub mod params;
/// Progress tracking utilities.
pub mod progress;
/// Lazy tensor views.
pub mod views;

/// Chains network functions after an existing node.
///
/// Evaluates to `Result<NodeId>` holding the last node added.
///
/// # Example
/// ```ignore
/// let output = sequential!(network, input, [
///     optimizer.create_fully_connected(784, 128, Bits::F32),
///     ActivationLayer::new(Box::new(Relu)),
/// ])?;
/// ```
#[macro_export]
macro_rules! sequential {
    ($network:expr, $from:expr, [$($function:expr),* $(,)?]) => {{
        let network: &mut $crate::ml::graph::NeuralNetwork = &mut $network;
        let last: $crate::error::Result<$crate::ml::graph::NodeId> = Ok($from);
        $(
            let last = last.and_then(|from| {
                let to = network.add_node($crate::ml::IntoFunction::into_function($function));
                network.connect(from, to).map(|_| to)
            });
        )*
        last
    }};
}

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use half::f16;

pub use crate::error::{MlError, Result};
use crate::quantize::quarter;
use views::View;

/// Extents of a 3-D tensor: rows, columns and channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Shape {
    pub rows: usize,
    pub columns: usize,
    pub channels: usize,
}

impl Shape {
    pub const fn new(rows: usize, columns: usize, channels: usize) -> Self {
        Self {
            rows,
            columns,
            channels,
        }
    }

    /// `1 x n x 1`
    pub const fn row(n: usize) -> Self {
        Self::new(1, n, 1)
    }

    /// `n x 1 x 1`
    pub const fn column(n: usize) -> Self {
        Self::new(n, 1, 1)
    }

    pub const fn size(&self) -> usize {
        self.rows * self.columns * self.channels
    }

    pub const fn is_vector(&self) -> bool {
        self.channels == 1 && (self.rows == 1 || self.columns == 1)
    }

    fn flat_index(&self, row: usize, column: usize, channel: usize) -> usize {
        channel * self.rows * self.columns + row * self.columns + column
    }

    fn coordinates(&self, index: usize) -> (usize, usize, usize) {
        let plane = self.rows * self.columns;
        let channel = index / plane;
        let offset = index % plane;
        (offset / self.columns, offset % self.columns, channel)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.rows, self.columns, self.channels)
    }
}

/// Bit width of a materialized tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Bits {
    F32,
    F16,
    Quarter,
}

impl Bits {
    pub fn bits(&self) -> u8 {
        match self {
            Bits::F32 => 32,
            Bits::F16 => 16,
            Bits::Quarter => 8,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            32 => Ok(Bits::F32),
            16 => Ok(Bits::F16),
            8 => Ok(Bits::Quarter),
            other => Err(MlError::InvalidArgument(format!(
                "unsupported bit width {other}, expected 32, 16 or 8"
            ))),
        }
    }
}

/// Backing storage of a materialized tensor.
#[derive(Clone, Debug)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Quarter { data: Vec<u8>, bias: i32 },
    /// Every element holds the same value.
    Uniform(f32),
}

impl TensorData {
    fn value(&self, index: usize) -> f32 {
        match self {
            TensorData::F32(v) => v[index],
            TensorData::F16(v) => v[index].to_f32(),
            TensorData::Quarter { data, bias } => quarter::decode(data[index], *bias),
            TensorData::Uniform(value) => *value,
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            TensorData::F32(v) => Some(v.len()),
            TensorData::F16(v) => Some(v.len()),
            TensorData::Quarter { data, .. } => Some(data.len()),
            TensorData::Uniform(_) => None,
        }
    }
}

pub(crate) enum TensorNode {
    Materialized(TensorData),
    View(View),
}

/// Shared handle to a 3-D tensor indexed by (row, column, channel).
///
/// Cloning is cheap and never copies storage. A tensor is either materialized (owns a
/// buffer) or a view that recomputes every value from its sources on read. Neither kind is
/// ever mutated; "updating" a tensor means building a new one and swapping the handle.
#[derive(Clone)]
pub struct Tensor {
    shape: Shape,
    node: Rc<TensorNode>,
}

impl Tensor {
    /// Materialized 32-bit tensor; values are in channel, row, column order.
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Self> {
        Self::from_data(shape, TensorData::F32(data))
    }

    pub fn from_data(shape: Shape, data: TensorData) -> Result<Self> {
        if let Some(len) = data.len() {
            if len != shape.size() {
                return Err(MlError::InvalidArgument(format!(
                    "{} values supplied for a {} tensor",
                    len, shape
                )));
            }
        }
        Ok(Self {
            shape,
            node: Rc::new(TensorNode::Materialized(data)),
        })
    }

    pub(crate) fn from_view(shape: Shape, view: View) -> Self {
        Self {
            shape,
            node: Rc::new(TensorNode::View(view)),
        }
    }

    pub fn row_vector(values: Vec<f32>) -> Self {
        let shape = Shape::row(values.len());
        Self {
            shape,
            node: Rc::new(TensorNode::Materialized(TensorData::F32(values))),
        }
    }

    pub fn column_vector(values: Vec<f32>) -> Self {
        let shape = Shape::column(values.len());
        Self {
            shape,
            node: Rc::new(TensorNode::Materialized(TensorData::F32(values))),
        }
    }

    /// Single channel tensor from `rows[row][column]`.
    pub fn from_matrix(rows: Vec<Vec<f32>>) -> Result<Self> {
        Self::from_channels(vec![rows])
    }

    /// Tensor from `channels[channel][row][column]`.
    pub fn from_channels(channels: Vec<Vec<Vec<f32>>>) -> Result<Self> {
        let row_count = channels.first().map_or(0, |c| c.len());
        let column_count = channels
            .first()
            .and_then(|c| c.first())
            .map_or(0, |r| r.len());
        let shape = Shape::new(row_count, column_count, channels.len());
        let mut data = Vec::with_capacity(shape.size());
        for channel in channels {
            if channel.len() != row_count {
                return Err(MlError::InvalidArgument(
                    "ragged channel: row counts differ".to_string(),
                ));
            }
            for row in channel {
                if row.len() != column_count {
                    return Err(MlError::InvalidArgument(
                        "ragged row: column counts differ".to_string(),
                    ));
                }
                data.extend(row);
            }
        }
        Self::new(data, shape)
    }

    pub fn uniform(shape: Shape, value: f32) -> Self {
        Self {
            shape,
            node: Rc::new(TensorNode::Materialized(TensorData::Uniform(value))),
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::uniform(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Self {
        Self::uniform(shape, 1.0)
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn row_count(&self) -> usize {
        self.shape.rows
    }

    pub fn column_count(&self) -> usize {
        self.shape.columns
    }

    pub fn channel_count(&self) -> usize {
        self.shape.channels
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    pub fn is_materialized(&self) -> bool {
        matches!(*self.node, TensorNode::Materialized(_))
    }

    /// Backing storage, if materialized.
    pub fn data(&self) -> Option<&TensorData> {
        match &*self.node {
            TensorNode::Materialized(data) => Some(data),
            TensorNode::View(_) => None,
        }
    }

    /// Width of the backing buffer; `None` for views and uniform tensors.
    pub fn bits(&self) -> Option<Bits> {
        match self.data()? {
            TensorData::F32(_) => Some(Bits::F32),
            TensorData::F16(_) => Some(Bits::F16),
            TensorData::Quarter { .. } => Some(Bits::Quarter),
            TensorData::Uniform(_) => None,
        }
    }

    pub fn quarter_bias(&self) -> Option<i32> {
        match self.data()? {
            TensorData::Quarter { bias, .. } => Some(*bias),
            _ => None,
        }
    }

    pub fn get_value(&self, row: usize, column: usize, channel: usize) -> f32 {
        debug_assert!(
            row < self.shape.rows && column < self.shape.columns && channel < self.shape.channels,
            "index ({row}, {column}, {channel}) out of bounds for {}",
            self.shape
        );
        match &*self.node {
            TensorNode::Materialized(data) => {
                data.value(self.shape.flat_index(row, column, channel))
            }
            TensorNode::View(view) => view.value(row, column, channel),
        }
    }

    /// Value at a flat index (channel, row, column order).
    pub fn get_flat(&self, index: usize) -> f32 {
        match &*self.node {
            TensorNode::Materialized(data) => data.value(index),
            TensorNode::View(_) => {
                let (row, column, channel) = self.shape.coordinates(index);
                self.get_value(row, column, channel)
            }
        }
    }

    /// First value, or 0 for an empty tensor.
    pub fn scalar(&self) -> f32 {
        if self.size() == 0 {
            return 0.0;
        }
        self.get_flat(0)
    }

    pub fn to_vec(&self) -> Vec<f32> {
        match &*self.node {
            TensorNode::Materialized(TensorData::F32(v)) => v.clone(),
            _ => (0..self.size()).map(|i| self.get_flat(i)).collect(),
        }
    }

    /// `(min, max)` over every value. Scans the whole tensor.
    pub fn range(&self) -> (f32, f32) {
        if self.size() == 0 {
            return (0.0, 0.0);
        }
        if let Some(TensorData::Uniform(value)) = self.data() {
            return (*value, *value);
        }
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for i in 0..self.size() {
            let value = self.get_flat(i);
            min = min.min(value);
            max = max.max(value);
        }
        (min, max)
    }

    /// Index of the largest value in `channel`.
    ///
    /// Scans the rows of column `major` for a column vector, otherwise the columns of row `major`.
    pub fn max_index(&self, channel: usize, major: usize) -> usize {
        let along_rows = self.shape.columns == 1 && self.shape.rows > 1;
        let count = if along_rows {
            self.shape.rows
        } else {
            self.shape.columns
        };
        let mut best_index = 0;
        let mut best_value = f32::NEG_INFINITY;
        for i in 0..count {
            let value = if along_rows {
                self.get_value(i, major, channel)
            } else {
                self.get_value(major, i, channel)
            };
            if value > best_value {
                best_value = value;
                best_index = i;
            }
        }
        best_index
    }

    /// Evaluate every value into an owned buffer of the requested width.
    ///
    /// Already materialized 32-bit tensors are returned as-is when 32 bits are requested.
    /// 8-bit tensors pick their quarter bias from the observed value range.
    pub fn materialize(&self, bits: Bits) -> Tensor {
        match bits {
            Bits::F32 => {
                if let Some(TensorData::F32(_)) = self.data() {
                    return self.clone();
                }
                self.with_data(TensorData::F32(self.to_vec()))
            }
            Bits::F16 => {
                let values = (0..self.size())
                    .map(|i| f16::from_f32(self.get_flat(i)))
                    .collect();
                self.with_data(TensorData::F16(values))
            }
            Bits::Quarter => {
                let (min, max) = self.range();
                let bias = quarter::estimate_bias(
                    quarter::MATERIALIZE_MIN_BIAS,
                    quarter::MATERIALIZE_MAX_BIAS,
                    min,
                    max,
                );
                self.materialize_quarter(bias)
            }
        }
    }

    /// 8-bit materialization with an explicit bias.
    pub fn materialize_quarter(&self, bias: i32) -> Tensor {
        let data = (0..self.size())
            .map(|i| quarter::encode(self.get_flat(i), bias))
            .collect();
        self.with_data(TensorData::Quarter { data, bias })
    }

    fn with_data(&self, data: TensorData) -> Tensor {
        Tensor {
            shape: self.shape,
            node: Rc::new(TensorNode::Materialized(data)),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Tensor");
        debug
            .field("shape", &self.shape)
            .field("materialized", &self.is_materialized());
        if self.size() <= 64 {
            debug.field("values", &self.to_vec());
        }
        debug.finish()
    }
}

/// Unit of computation held by a graph node.
///
/// `forward` receives one tensor per incoming connection (or the external input for a
/// head node). `backward` receives the error of this function's output and returns the
/// error of its input.
pub trait NetworkFunction {
    fn forward(&mut self, inputs: &[Tensor], training: bool) -> Result<Tensor>;
    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor>;
    fn has_params(&self) -> bool {
        false
    }
    /// Whether `forward` hands an owned buffer downstream or the lazy view itself.
    /// Functions whose output is always a view of their input ignore it.
    fn set_materialized(&mut self, _materialized: bool) {}
    fn save_param(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
    fn load_param(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Conversion used by [`sequential!`] so it accepts both concrete and boxed functions.
pub trait IntoFunction {
    fn into_function(self) -> Box<dyn NetworkFunction>;
}

impl<F: NetworkFunction + 'static> IntoFunction for F {
    fn into_function(self) -> Box<dyn NetworkFunction> {
        Box::new(self)
    }
}

impl IntoFunction for Box<dyn NetworkFunction> {
    fn into_function(self) -> Box<dyn NetworkFunction> {
        self
    }
}

/// Factory for trainable layers. The optimizer decides how their weights are updated.
pub trait Optimizer {
    fn create_fully_connected(
        &self,
        input_size: usize,
        output_size: usize,
        bits: Bits,
    ) -> Result<Box<dyn NetworkFunction>>;
    fn create_bias(&self, shape: Shape, bits: Bits) -> Result<Box<dyn NetworkFunction>>;
    fn create_convolution_2d(
        &self,
        input_shape: Shape,
        filters: usize,
        kernel_size: usize,
        bits: Bits,
    ) -> Result<Box<dyn NetworkFunction>>;
}

/// The only input of a single-input function.
pub(crate) fn single_input<'a>(inputs: &'a [Tensor], function: &str) -> Result<&'a Tensor> {
    match inputs {
        [input] => Ok(input),
        [] => Err(MlError::MissingInput(format!("{function} received no input"))),
        _ => Err(MlError::InvalidArgument(format!(
            "{function} only supports a single input, got {}",
            inputs.len()
        ))),
    }
}

/// Layer output as handed to the next node: a 32-bit buffer, or the view when
/// materialization is switched off.
pub(crate) fn layer_output(output: Tensor, materialized: bool) -> Tensor {
    if materialized {
        output.materialize(Bits::F32)
    } else {
        output
    }
}

/// Drain buffered forward inputs into their arithmetic mean.
pub(crate) fn average_buffered(buffer: &mut VecDeque<Tensor>, function: &str) -> Result<Tensor> {
    let count = buffer.len();
    let mut sum = buffer.pop_front().ok_or_else(|| {
        MlError::MissingInput(format!("{function}.backward() called without previous inputs"))
    })?;
    while let Some(next) = buffer.pop_front() {
        sum = sum.add_tensor(&next)?;
    }
    if count > 1 {
        sum = sum.scale(1.0 / count as f32).materialize(Bits::F32);
    }
    Ok(sum)
}
