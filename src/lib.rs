#![allow(missing_docs)]
//! Minimal machine learning library built on lazy tensor views
//!
//! `microml` provides:
//!
//! - 3-D tensors (row, column, channel) that are either materialized at 32, 16 or 8 bits,
//!   or lazy views recomputed from their sources on every read
//! - An 8-bit "quarter" float with a caller supplied exponent bias
//! - Activation, fully-connected, bias and 2-D convolution functions
//! - A DAG computation graph with fan-in/fan-out aware forward and backward passes
//! - A mini-batch gradient descent optimizer with per-bit-width update scaling
//!
//! # Features
//!
//! - `serialization`: derive `serde` traits on shapes and configuration
//! - `logging`: TensorBoard logging of training loss (adds `tensorboard-rs`, `chrono`)
//! - `full`: Enable all features
//!
//! By default, **no optional features are enabled**.
//!
//! # Usage Example
//!
//! ```
//! use microml::dataset::{InMemoryDataSource, TrainingPair};
//! use microml::ml::builder::{NetworkBuilder, NodeType};
//! use microml::ml::funcs::{ActivationType, MeanSquaredError};
//! use microml::ml::graph::TrainingConfig;
//! use microml::ml::optim::{MbgdConfig, MbgdOptimizer};
//! use microml::ml::{Shape, Tensor};
//!
//! let mut model = NetworkBuilder::new()
//!     .add_input(Shape::row(1), 1, NodeType::Full, ActivationType::Linear)
//!     .add_output(Shape::row(1), ActivationType::Linear)
//!     .build(
//!         Box::new(MeanSquaredError),
//!         Box::new(MbgdOptimizer::new(MbgdConfig::new(0.05))),
//!     )
//!     .unwrap();
//!
//! let records = (0..4)
//!     .map(|i| {
//!         let x = i as f32 * 0.25;
//!         TrainingPair::single(Tensor::row_vector(vec![x]), Tensor::row_vector(vec![2.0 * x]))
//!     })
//!     .collect();
//! let mut source = InMemoryDataSource::new(records);
//! let config = TrainingConfig { epochs: 5, show_progress: false, ..Default::default() };
//! model.train(&mut source, &config).unwrap();
//! let _y = model.predict_scalar(&Tensor::row_vector(vec![0.5])).unwrap();
//! ```

/// Training data sources.
pub mod dataset;
/// Error types.
pub mod error;
/// Tensors, views, network functions and the computation graph.
pub mod ml;
/// 8-bit quarter float codec.
pub mod quantize;
/// Random number generation helpers.
pub mod utills;

pub use error::{MlError, Result};
