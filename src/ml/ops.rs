use super::{single_input, Bits, NetworkFunction, Shape, Tensor};
use crate::error::{MlError, Result};

/// Join point: sums every incoming tensor.
///
/// Each input contributes with weight one, so the output error flows back unchanged to all of them.
#[derive(Default)]
pub struct AddInputs;

impl AddInputs {
    pub fn new() -> Self {
        AddInputs
    }
}

impl NetworkFunction for AddInputs {
    fn forward(&mut self, inputs: &[Tensor], _training: bool) -> Result<Tensor> {
        let (first, rest) = inputs
            .split_first()
            .ok_or_else(|| MlError::MissingInput("AddInputs received no input".to_string()))?;
        let mut sum = first.clone();
        for input in rest {
            sum = sum.add_tensor(input)?;
        }
        Ok(sum.materialize(Bits::F32))
    }

    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        Ok(output_error.clone())
    }
}

/// Reshapes its input into a single row, for feeding grids into dense layers.
#[derive(Default)]
pub struct Flatten {
    source_shape: Option<Shape>,
}

impl Flatten {
    pub fn new() -> Self {
        Flatten { source_shape: None }
    }
}

impl NetworkFunction for Flatten {
    fn forward(&mut self, inputs: &[Tensor], _training: bool) -> Result<Tensor> {
        let input = single_input(inputs, "Flatten")?;
        self.source_shape = Some(input.shape());
        input.reshape(Shape::row(input.size()))
    }

    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        let shape = self.source_shape.ok_or_else(|| {
            MlError::MissingInput("Flatten.backward() called without previous inputs".to_string())
        })?;
        output_error.reshape(shape)
    }
}

/// Reinterprets its input with fixed extents; the error is reshaped back on the way out.
pub struct Reshape {
    target: Shape,
    source_shape: Option<Shape>,
}

impl Reshape {
    pub fn new(target: Shape) -> Self {
        Reshape {
            target,
            source_shape: None,
        }
    }
}

impl NetworkFunction for Reshape {
    fn forward(&mut self, inputs: &[Tensor], _training: bool) -> Result<Tensor> {
        let input = single_input(inputs, "Reshape")?;
        let output = input.reshape(self.target)?;
        self.source_shape = Some(input.shape());
        Ok(output)
    }

    fn backward(&mut self, output_error: &Tensor) -> Result<Tensor> {
        let shape = self.source_shape.ok_or_else(|| {
            MlError::MissingInput("Reshape.backward() called without previous inputs".to_string())
        })?;
        output_error.reshape(shape)
    }
}
