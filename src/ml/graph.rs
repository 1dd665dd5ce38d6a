//! Computation graph.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Connections are plain
//! `(from, to)` index pairs that also carry the value in flight during a forward pass and
//! the staged error at fan-out points during a backward pass.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::funcs::LossFunction;
#[cfg(feature = "logging")]
use super::logger::TensorBoardLogger;
use super::progress::TrainingProgress;
use super::{Bits, NetworkFunction, Optimizer, Tensor};
use crate::dataset::DataSource;
use crate::error::{MlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Node {
    function: Box<dyn NetworkFunction>,
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
    last_output: Option<Tensor>,
}

struct Connection {
    from: NodeId,
    to: NodeId,
    next_input: Option<Tensor>,
    prior_error: Option<Tensor>,
}

/// Directed acyclic graph of network functions.
#[derive(Default)]
pub struct NeuralNetwork {
    nodes: Vec<Node>,
    connections: Vec<Connection>,
    heads: Vec<NodeId>,
    outputs: Vec<NodeId>,
    order: Option<Vec<NodeId>>,
}

impl NeuralNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn heads(&self) -> &[NodeId] {
        &self.heads
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn add_node(&mut self, function: Box<dyn NetworkFunction>) -> NodeId {
        self.nodes.push(Node {
            function,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            last_output: None,
        });
        self.order = None;
        NodeId(self.nodes.len() - 1)
    }

    /// Add a node that receives external input. Heads are fed in registration order.
    pub fn add_head(&mut self, function: Box<dyn NetworkFunction>) -> NodeId {
        let id = self.add_node(function);
        self.heads.push(id);
        id
    }

    /// Register a terminal node whose output `predict` returns, in registration order.
    pub fn add_output(&mut self, id: NodeId) -> Result<()> {
        self.check_node(id)?;
        if self.outputs.contains(&id) {
            return Err(MlError::InvalidArgument(format!(
                "node {} is already an output",
                id.0
            )));
        }
        self.outputs.push(id);
        Ok(())
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.check_node(from)?;
        self.check_node(to)?;
        if from == to {
            return Err(MlError::InvalidArgument(format!(
                "node {} cannot connect to itself",
                from.0
            )));
        }
        if self.heads.contains(&to) {
            return Err(MlError::InvalidArgument(format!(
                "head node {} cannot have incoming connections",
                to.0
            )));
        }
        if self.outputs.contains(&from) {
            return Err(MlError::InvalidArgument(format!(
                "output node {} cannot have outgoing connections",
                from.0
            )));
        }
        let duplicate = self.nodes[from.0]
            .outgoing
            .iter()
            .any(|&c| self.connections[c].to == to);
        if duplicate {
            return Err(MlError::InvalidArgument(format!(
                "nodes {} and {} are already connected",
                from.0, to.0
            )));
        }

        let connection = self.connections.len();
        self.connections.push(Connection {
            from,
            to,
            next_input: None,
            prior_error: None,
        });
        self.nodes[from.0].outgoing.push(connection);
        self.nodes[to.0].incoming.push(connection);
        self.order = None;
        Ok(())
    }

    fn check_node(&self, id: NodeId) -> Result<()> {
        if id.0 >= self.nodes.len() {
            return Err(MlError::InvalidArgument(format!(
                "node {} does not exist",
                id.0
            )));
        }
        Ok(())
    }

    /// Kahn's algorithm; cached until the structure changes.
    pub fn topological_order(&mut self) -> Result<Vec<NodeId>> {
        if let Some(order) = &self.order {
            return Ok(order.clone());
        }
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.incoming.len()).collect();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| pending[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(index) = ready.pop_front() {
            order.push(NodeId(index));
            for &c in &self.nodes[index].outgoing {
                let to = self.connections[c].to.0;
                pending[to] -= 1;
                if pending[to] == 0 {
                    ready.push_back(to);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(MlError::InvalidArgument(
                "network contains a cycle".to_string(),
            ));
        }
        self.order = Some(order.clone());
        Ok(order)
    }

    /// Run every node once, feeding `inputs[i]` to head `i`, and return the output nodes'
    /// results in registration order.
    ///
    /// A node fires only after every incoming connection has delivered its value.
    pub fn forward(&mut self, inputs: &[Tensor], training: bool) -> Result<Vec<Tensor>> {
        if inputs.len() != self.heads.len() {
            return Err(MlError::InvalidArgument(format!(
                "predict requires {} input tensors, one per head node, got {}",
                self.heads.len(),
                inputs.len()
            )));
        }
        let order = self.topological_order()?;
        for connection in &mut self.connections {
            connection.next_input = None;
            connection.prior_error = None;
        }
        for node in &mut self.nodes {
            node.last_output = None;
        }

        for id in order {
            let node_inputs = if let Some(head) = self.heads.iter().position(|&h| h == id) {
                vec![inputs[head].clone()]
            } else {
                let incoming = &self.nodes[id.0].incoming;
                if incoming.is_empty() {
                    return Err(MlError::MissingInput(format!(
                        "node {} has neither incoming connections nor external input",
                        id.0
                    )));
                }
                let mut values = Vec::with_capacity(incoming.len());
                for &c in incoming {
                    let value = self.connections[c].next_input.take().ok_or_else(|| {
                        MlError::MissingInput(format!(
                            "node {} is waiting on node {}",
                            id.0, self.connections[c].from.0
                        ))
                    })?;
                    values.push(value);
                }
                values
            };

            let node = &mut self.nodes[id.0];
            let output = node.function.forward(&node_inputs, training)?;
            if node.outgoing.is_empty() {
                node.last_output = Some(output);
            } else {
                for &c in &node.outgoing {
                    self.connections[c].next_input = Some(output.clone());
                }
            }
        }

        self.outputs
            .iter()
            .map(|&id| {
                self.nodes[id.0].last_output.clone().ok_or_else(|| {
                    MlError::MissingInput(format!("output node {} produced no value", id.0))
                })
            })
            .collect()
    }

    pub fn predict(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.forward(inputs, false)
    }

    /// Prediction for a network with one head; returns the first output.
    pub fn predict_one(&mut self, input: &Tensor) -> Result<Tensor> {
        self.predict(std::slice::from_ref(input))?
            .into_iter()
            .next()
            .ok_or_else(|| MlError::MissingInput("network has no output nodes".to_string()))
    }

    pub fn predict_scalar(&mut self, input: &Tensor) -> Result<f32> {
        Ok(self.predict_one(input)?.scalar())
    }

    /// Propagate `error` backward from the terminal node `output`.
    ///
    /// A node whose output fans out to several consumers waits until every consumer has
    /// staged its error, then propagates their mean once.
    pub fn backward(&mut self, output: NodeId, error: &Tensor) -> Result<()> {
        self.check_node(output)?;
        if !self.nodes[output.0].outgoing.is_empty() {
            return Err(MlError::InvalidArgument(format!(
                "backward must start at a node without outgoing connections, node {} has {}",
                output.0,
                self.nodes[output.0].outgoing.len()
            )));
        }

        let mut stack = vec![(output, error.clone())];
        while let Some((id, output_error)) = stack.pop() {
            let prior_error = self.nodes[id.0].function.backward(&output_error)?;
            debug!(node = id.0, shape = %prior_error.shape(), "backward");

            for c in self.nodes[id.0].incoming.clone() {
                let source = self.connections[c].from;
                let fan_out = &self.nodes[source.0].outgoing;
                if fan_out.len() == 1 {
                    stack.push((source, prior_error.clone()));
                    continue;
                }
                self.connections[c].prior_error = Some(prior_error.clone());
                let complete = fan_out
                    .iter()
                    .all(|&o| self.connections[o].prior_error.is_some());
                if complete {
                    let staged: Vec<Tensor> = self.nodes[source.0]
                        .outgoing
                        .iter()
                        .filter_map(|&o| self.connections[o].prior_error.take())
                        .collect();
                    stack.push((source, mean(&staged)?));
                }
            }
        }
        Ok(())
    }

    /// Write one `<node index>.param` file per node that owns parameters.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.function.has_params() {
                node.function.save_param(&dir.join(format!("{}.param", i)))?;
            }
        }
        Ok(())
    }

    pub fn load(&mut self, dir: &Path) -> Result<()> {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if node.function.has_params() {
                node.function.load_param(&dir.join(format!("{}.param", i)))?;
            }
        }
        Ok(())
    }
}

/// Unweighted arithmetic mean.
fn mean(tensors: &[Tensor]) -> Result<Tensor> {
    let (first, rest) = tensors
        .split_first()
        .ok_or_else(|| MlError::MissingInput("no staged errors".to_string()))?;
    let mut sum = first.clone();
    for tensor in rest {
        sum = sum.add_tensor(tensor)?;
    }
    Ok(sum.scale(1.0 / tensors.len() as f32).materialize(Bits::F32))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Records forwarded before each backward pass.
    pub batch_size: usize,
    pub show_progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 1,
            batch_size: 1,
            show_progress: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingReport {
    /// Mean displayed loss of each epoch.
    pub epoch_losses: Vec<f32>,
    /// Records trained on in each epoch.
    pub epoch_records: Vec<usize>,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// A network together with the loss and optimizer used to train it.
pub struct NeuralNetworkForTraining {
    network: NeuralNetwork,
    loss: Box<dyn LossFunction>,
    optimizer: Box<dyn Optimizer>,
    #[cfg(feature = "logging")]
    logger: Option<TensorBoardLogger>,
}

impl NeuralNetworkForTraining {
    pub fn new(
        network: NeuralNetwork,
        loss: Box<dyn LossFunction>,
        optimizer: Box<dyn Optimizer>,
    ) -> Self {
        NeuralNetworkForTraining {
            network,
            loss,
            optimizer,
            #[cfg(feature = "logging")]
            logger: None,
        }
    }

    #[cfg(feature = "logging")]
    pub fn with_logger(mut self, logger: TensorBoardLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn network(&self) -> &NeuralNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut NeuralNetwork {
        &mut self.network
    }

    pub fn into_network(self) -> NeuralNetwork {
        self.network
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn set_loss(&mut self, loss: Box<dyn LossFunction>) {
        self.loss = loss;
    }

    pub fn predict(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.network.predict(inputs)
    }

    pub fn predict_one(&mut self, input: &Tensor) -> Result<Tensor> {
        self.network.predict_one(input)
    }

    pub fn predict_scalar(&mut self, input: &Tensor) -> Result<f32> {
        self.network.predict_scalar(input)
    }

    /// Train for `config.epochs` passes over `source`.
    ///
    /// Each epoch shuffles the source and walks it in batches of `config.batch_size`
    /// records: every record is forwarded, the loss derivatives of each output are averaged
    /// over the batch, then one backward pass runs per output. Any error aborts training.
    pub fn train(
        &mut self,
        source: &mut dyn DataSource,
        config: &TrainingConfig,
    ) -> Result<TrainingReport> {
        if config.batch_size == 0 {
            return Err(MlError::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }
        let outputs = self.network.outputs().to_vec();
        let mut progress =
            TrainingProgress::new(config.epochs, source.record_count(), config.show_progress);
        let mut report = TrainingReport::default();

        for epoch in 0..config.epochs {
            progress.start_epoch();
            source.shuffle();
            let mut total_loss = 0.0;
            let mut loss_count = 0usize;

            loop {
                let mut derivatives: Vec<Option<Tensor>> = vec![None; outputs.len()];
                let mut batch = 0usize;
                while batch < config.batch_size {
                    let record = match source.next_record() {
                        Some(record) => record,
                        None => break,
                    };
                    batch += 1;
                    let results = self.network.forward(&record.given, true)?;
                    if record.expected.len() != results.len() {
                        return Err(MlError::InvalidArgument(format!(
                            "record has {} expected tensors for {} outputs",
                            record.expected.len(),
                            results.len()
                        )));
                    }
                    let mut record_loss = 0.0;
                    for (i, (expected, actual)) in record.expected.iter().zip(&results).enumerate()
                    {
                        let loss = self.loss.compute_total_for_display(expected, actual)?;
                        record_loss += loss;
                        total_loss += loss;
                        loss_count += 1;

                        let derivative = self.loss.partial_derivative(expected, actual)?;
                        derivatives[i] = Some(match derivatives[i].take() {
                            Some(sum) => sum.add_tensor(&derivative)?,
                            None => derivative,
                        });
                    }
                    // summed over outputs
                    progress.update_record(record_loss);
                    #[cfg(feature = "logging")]
                    if let Some(logger) = self.logger.as_mut() {
                        logger.log_loss(record_loss);
                    }
                }
                if batch == 0 {
                    break;
                }
                for (output, derivative) in outputs.iter().zip(derivatives) {
                    if let Some(derivative) = derivative {
                        let averaged = derivative.scale(1.0 / batch as f32).materialize(Bits::F32);
                        self.network.backward(*output, &averaged)?;
                    }
                }
            }
            source.restart();

            let epoch_loss = total_loss / loss_count.max(1) as f32;
            info!(
                epoch = epoch + 1,
                epochs = config.epochs,
                loss = epoch_loss,
                elapsed_ms = progress.elapsed().as_millis() as u64,
                "finished epoch"
            );
            #[cfg(feature = "logging")]
            if let Some(logger) = self.logger.as_mut() {
                logger.log_epoch_loss(epoch, epoch_loss);
            }
            report.epoch_losses.push(epoch_loss);
            report.epoch_records.push(progress.current_record());
        }
        progress.finish();
        Ok(report)
    }
}
