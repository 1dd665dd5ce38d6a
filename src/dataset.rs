use crate::error::{MlError, Result};
use crate::ml::{Shape, Tensor};
use crate::utills::rand::XorShift64;

/// One training record: one tensor per head node and one per output node.
#[derive(Clone, Debug)]
pub struct TrainingPair {
    pub given: Vec<Tensor>,
    pub expected: Vec<Tensor>,
}

impl TrainingPair {
    pub fn new(given: Vec<Tensor>, expected: Vec<Tensor>) -> Self {
        TrainingPair { given, expected }
    }

    /// Record for a single-input, single-output network.
    pub fn single(given: Tensor, expected: Tensor) -> Self {
        TrainingPair {
            given: vec![given],
            expected: vec![expected],
        }
    }
}

/// Finite, restartable sequence of training records.
pub trait DataSource {
    /// Reorder the records for the next pass.
    fn shuffle(&mut self);
    /// Rewind to the first record.
    fn restart(&mut self);
    fn record_count(&self) -> usize;
    /// Next record, or `None` once the pass is exhausted.
    fn next_record(&mut self) -> Option<TrainingPair>;
}

/// Data source over records held in memory.
pub struct InMemoryDataSource {
    records: Vec<TrainingPair>,
    cursor: usize,
    rng: XorShift64,
}

impl InMemoryDataSource {
    pub fn new(records: Vec<TrainingPair>) -> Self {
        Self::with_seed(records, crate::ml::optim::DEFAULT_SEED)
    }

    pub fn with_seed(records: Vec<TrainingPair>, seed: u64) -> Self {
        InMemoryDataSource {
            records,
            cursor: 0,
            rng: XorShift64::new(seed),
        }
    }

    /// Shuffle order differs between runs.
    pub fn with_entropy(records: Vec<TrainingPair>) -> Self {
        InMemoryDataSource {
            records,
            cursor: 0,
            rng: XorShift64::from_entropy(),
        }
    }

    /// Pairs each given tensor with the expected tensor at the same position.
    pub fn from_tensors(given: Vec<Tensor>, expected: Vec<Tensor>) -> Result<Self> {
        if given.len() != expected.len() {
            return Err(MlError::InvalidArgument(format!(
                "{} given tensors but {} expected tensors",
                given.len(),
                expected.len()
            )));
        }
        let records = given
            .into_iter()
            .zip(expected)
            .map(|(given, expected)| TrainingPair::single(given, expected))
            .collect();
        Ok(Self::new(records))
    }

    pub fn records(&self) -> &[TrainingPair] {
        &self.records
    }

    /// Shapes of the first record's given tensors.
    pub fn given_shapes(&self) -> Vec<Shape> {
        self.records
            .first()
            .map(|r| r.given.iter().map(Tensor::shape).collect())
            .unwrap_or_default()
    }

    /// Shapes of the first record's expected tensors.
    pub fn expected_shapes(&self) -> Vec<Shape> {
        self.records
            .first()
            .map(|r| r.expected.iter().map(Tensor::shape).collect())
            .unwrap_or_default()
    }
}

impl DataSource for InMemoryDataSource {
    fn shuffle(&mut self) {
        self.rng.shuffle(&mut self.records);
    }

    fn restart(&mut self) {
        self.cursor = 0;
    }

    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn next_record(&mut self) -> Option<TrainingPair> {
        let record = self.records.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(record)
    }
}
