use super::graph::NeuralNetwork;
use super::Tensor;
use crate::dataset::DataSource;
use crate::error::{MlError, Result};

/// Classification metrics for evaluating model performance
pub struct ClassificationMetrics;

impl ClassificationMetrics {
    /// Fraction of pairs whose largest prediction sits at the same index as the largest
    /// expected value. Tensors are row or column vectors; only channel 0 is compared.
    ///
    /// # Example
    /// ```
    /// use microml::ml::metrics::ClassificationMetrics;
    /// use microml::ml::Tensor;
    ///
    /// let predictions = vec![Tensor::row_vector(vec![0.1, 0.9]), Tensor::row_vector(vec![0.8, 0.2])];
    /// let expected = vec![Tensor::row_vector(vec![0.0, 1.0]), Tensor::row_vector(vec![0.0, 1.0])];
    /// let accuracy = ClassificationMetrics::accuracy(&predictions, &expected).unwrap();
    /// assert_eq!(accuracy, 0.5);
    /// ```
    pub fn accuracy(predictions: &[Tensor], expected: &[Tensor]) -> Result<f32> {
        if predictions.len() != expected.len() {
            return Err(MlError::InvalidArgument(format!(
                "{} predictions but {} expected values",
                predictions.len(),
                expected.len()
            )));
        }
        if predictions.is_empty() {
            return Ok(0.0);
        }
        let mut correct = 0;
        for (prediction, target) in predictions.iter().zip(expected) {
            if prediction.shape() != target.shape() {
                return Err(MlError::ShapeMismatch {
                    operation: "accuracy",
                    expected: target.shape(),
                    actual: prediction.shape(),
                });
            }
            if prediction.max_index(0, 0) == target.max_index(0, 0) {
                correct += 1;
            }
        }
        Ok(correct as f32 / predictions.len() as f32)
    }

    /// Accuracy of the first output over one full pass of `source`.
    pub fn evaluate(network: &mut NeuralNetwork, source: &mut dyn DataSource) -> Result<f32> {
        source.restart();
        let mut predictions = Vec::with_capacity(source.record_count());
        let mut expected = Vec::with_capacity(source.record_count());
        while let Some(record) = source.next_record() {
            let outputs = network.predict(&record.given)?;
            let target = record.expected.into_iter().next();
            match (outputs.into_iter().next(), target) {
                (Some(output), Some(target)) => {
                    predictions.push(output);
                    expected.push(target);
                }
                _ => {
                    return Err(MlError::MissingInput(
                        "record or network has no output".to_string(),
                    ))
                }
            }
        }
        source.restart();
        Self::accuracy(&predictions, &expected)
    }
}
