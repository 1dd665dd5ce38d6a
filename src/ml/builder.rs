//! Sequential model builder.
//!
//! ```
//! use microml::ml::builder::{NetworkBuilder, NodeType};
//! use microml::ml::funcs::{ActivationType, MeanSquaredError};
//! use microml::ml::optim::{MbgdConfig, MbgdOptimizer};
//! use microml::ml::Shape;
//!
//! let model = NetworkBuilder::new()
//!     .add_input(Shape::row(2), 4, NodeType::Full, ActivationType::Relu)
//!     .add_output(Shape::row(1), ActivationType::Linear)
//!     .build(
//!         Box::new(MeanSquaredError),
//!         Box::new(MbgdOptimizer::new(MbgdConfig::new(0.01))),
//!     )
//!     .unwrap();
//! assert_eq!(model.network().outputs().len(), 1);
//! ```

use super::funcs::{ActivationLayer, ActivationType, LossFunction};
use super::graph::{NeuralNetwork, NeuralNetworkForTraining, NodeId};
use super::ops::{Flatten, Reshape};
use super::{Bits, NetworkFunction, Optimizer, Shape};
use crate::error::{MlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeType {
    /// Fully-connected; `size` is the number of output units.
    Full,
    /// 2-D convolution; `size` is the number of filters.
    Convolution2d { kernel_size: usize },
}

#[derive(Clone, Copy, Debug)]
struct LayerSpec {
    size: usize,
    node_type: NodeType,
    activation: ActivationType,
    use_bias: bool,
    bits: Bits,
    materialized: bool,
}

/// Builds a chain of layers, each `[flatten] -> trainable function -> [bias] -> activation`.
#[derive(Default)]
pub struct NetworkBuilder {
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
    layers: Vec<LayerSpec>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(
        mut self,
        shape: Shape,
        size: usize,
        node_type: NodeType,
        activation: ActivationType,
    ) -> Self {
        self.input_shape = Some(shape);
        self.add_layer(size, node_type, activation)
    }

    pub fn add_node(self, size: usize, node_type: NodeType, activation: ActivationType) -> Self {
        self.add_layer(size, node_type, activation)
    }

    /// Final fully-connected layer producing `shape.size()` values laid out as `shape`.
    pub fn add_output(mut self, shape: Shape, activation: ActivationType) -> Self {
        self.output_shape = Some(shape);
        self.add_layer(shape.size(), NodeType::Full, activation)
    }

    /// Applies to the most recently added layer. Bias is on by default.
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        if let Some(layer) = self.layers.last_mut() {
            layer.use_bias = use_bias;
        }
        self
    }

    /// Applies to the most recently added layer. 32 bits by default.
    pub fn bits(mut self, bits: Bits) -> Self {
        if let Some(layer) = self.layers.last_mut() {
            layer.bits = bits;
        }
        self
    }

    /// Applies to the most recently added layer. When off, the layer's functions pass
    /// lazy views downstream instead of 32-bit buffers. On by default.
    pub fn materialized(mut self, materialized: bool) -> Self {
        if let Some(layer) = self.layers.last_mut() {
            layer.materialized = materialized;
        }
        self
    }

    fn add_layer(mut self, size: usize, node_type: NodeType, activation: ActivationType) -> Self {
        self.layers.push(LayerSpec {
            size,
            node_type,
            activation,
            use_bias: true,
            bits: Bits::F32,
            materialized: true,
        });
        self
    }

    pub fn build(
        self,
        loss: Box<dyn LossFunction>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<NeuralNetworkForTraining> {
        let mut shape = self.input_shape.ok_or_else(|| {
            MlError::InvalidArgument("add_input must be called before build".to_string())
        })?;
        let output_shape = self.output_shape.ok_or_else(|| {
            MlError::InvalidArgument("add_output must be called before build".to_string())
        })?;

        let mut network = NeuralNetwork::new();
        let mut last: Option<NodeId> = None;
        for layer in &self.layers {
            if layer.size == 0 {
                return Err(MlError::InvalidArgument(
                    "layer size must be at least 1".to_string(),
                ));
            }
            match layer.node_type {
                NodeType::Full => {
                    if shape != Shape::row(shape.size()) {
                        last = Some(append(&mut network, last, Box::new(Flatten::new()))?);
                        shape = Shape::row(shape.size());
                    }
                    let mut function =
                        optimizer.create_fully_connected(shape.columns, layer.size, layer.bits)?;
                    function.set_materialized(layer.materialized);
                    last = Some(append(&mut network, last, function)?);
                    shape = Shape::row(layer.size);
                }
                NodeType::Convolution2d { kernel_size } => {
                    let mut function =
                        optimizer.create_convolution_2d(shape, layer.size, kernel_size, layer.bits)?;
                    function.set_materialized(layer.materialized);
                    last = Some(append(&mut network, last, function)?);
                    shape = Shape::new(
                        shape.rows + 1 - kernel_size,
                        shape.columns + 1 - kernel_size,
                        layer.size,
                    );
                }
            }
            if layer.use_bias {
                let mut bias = optimizer.create_bias(shape, layer.bits)?;
                bias.set_materialized(layer.materialized);
                last = Some(append(&mut network, last, bias)?);
            }
            let mut activation = ActivationLayer::of(layer.activation);
            activation.set_materialized(layer.materialized);
            last = Some(append(&mut network, last, Box::new(activation))?);
        }

        if shape != output_shape {
            let reshape = Box::new(Reshape::new(output_shape));
            last = Some(append(&mut network, last, reshape)?);
        }
        let output = last.ok_or_else(|| {
            MlError::InvalidArgument("network has no layers".to_string())
        })?;
        network.add_output(output)?;

        Ok(NeuralNetworkForTraining::new(network, loss, optimizer))
    }
}

/// Add `function` after `previous`, or as the head when there is none.
fn append(
    network: &mut NeuralNetwork,
    previous: Option<NodeId>,
    function: Box<dyn NetworkFunction>,
) -> Result<NodeId> {
    match previous {
        None => Ok(network.add_head(function)),
        Some(from) => {
            let to = network.add_node(function);
            network.connect(from, to)?;
            Ok(to)
        }
    }
}
