use ndarray::{Array2, ArrayView2};

pub struct MatrixHelper;

impl MatrixHelper {
    /// Multiply two 2D arrays.
    pub fn multiply(lhs: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Array2<f64> {
        lhs.dot(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn multiply_applies_rotation() {
        let vectors = array![[1.0, 0.0], [0.0, 2.0]];
        let swap = array![[0.0, 1.0], [1.0, 0.0]];
        let product = MatrixHelper::multiply(vectors.view(), swap.view());
        assert_eq!(product, array![[0.0, 1.0], [2.0, 0.0]]);
    }
}
