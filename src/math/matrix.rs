use rand::prelude::*;
use serde::{Serialize, Deserialize};
use std::f64::consts::PI;
use std::ops::Mul;

use crate::error::{Result, TptError};

/// Dense row-major matrix. In this crate a row is almost always one view of a
/// sample and a column one class (or one embedding dimension).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix{
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<Vec<f64>>
}

impl Matrix{
    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix{
            rows,
            cols,
            data: vec![vec![0.0; cols]; rows]
        }
    }

    /// Samples a single value from N(0, 1) using the Box-Muller transform.
    fn sample_standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
        // (0, 1] on both draws keeps ln() finite.
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = 1.0 - rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    /// Gaussian matrix with the given standard deviation, drawn from `rng`.
    pub fn gaussian<R: Rng + ?Sized>(rows: usize, cols: usize, std_dev: f64, rng: &mut R) -> Matrix {
        let mut res = Matrix::zeros(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                res.data[i][j] = Matrix::sample_standard_normal(rng) * std_dev;
            }
        }
        res
    }

    /// Xavier (Glorot) initialization: N(0, sqrt(1 / rows)).
    ///
    /// Used for the frozen projections, where `rows` is the fan-in
    /// (`x · W` with `x` a row vector).
    pub fn xavier<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
        let std_dev = (1.0 / rows.max(1) as f64).sqrt();
        Matrix::gaussian(rows, cols, std_dev, rng)
    }

    pub fn transpose(&self) -> Matrix {
        let mut res = Matrix::zeros(self.cols, self.rows);

        for i in 0..res.rows {
            for j in 0..res.cols {
                res.data[i][j] = self.data[j][i];
            }
        }

        res
    }

    pub fn map<F>(&self, functor: F) -> Matrix
    where
        F: Fn(f64) -> f64,
    {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter()
                .map(|row| row.iter().map(|&x| functor(x)).collect())
                .collect(),
        }
    }

    /// Builds a matrix from row vectors. All rows must share one length.
    pub fn from_rows(data: Vec<Vec<f64>>) -> Result<Matrix> {
        let cols = data.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = data.iter().find(|r| r.len() != cols) {
            return Err(TptError::ShapeMismatch {
                context: "Matrix::from_rows",
                expected: (data.len(), cols),
                actual: (data.len(), bad.len()),
            });
        }
        Ok(Matrix { rows: data.len(), cols, data })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i]
    }

    /// Copies the listed rows, in the listed order.
    pub fn select_rows(&self, indices: &[usize]) -> Matrix {
        Matrix {
            rows: indices.len(),
            cols: self.cols,
            data: indices.iter().map(|&i| self.data[i].clone()).collect(),
        }
    }

    /// Row-wise softmax (max-shifted).
    pub fn softmax_rows(&self) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|row| softmax(row)).collect(),
        }
    }

    /// Column-wise mean across rows, i.e. the average distribution of a batch.
    pub fn mean_rows(&self) -> Vec<f64> {
        let mut acc = vec![0.0; self.cols];
        if self.rows == 0 {
            return acc;
        }
        for row in &self.data {
            for (a, x) in acc.iter_mut().zip(row) {
                *a += x;
            }
        }
        let inv = 1.0 / self.rows as f64;
        acc.iter_mut().for_each(|a| *a *= inv);
        acc
    }

    /// Fails with `ShapeMismatch` unless `other` has the same shape.
    pub fn ensure_same_shape(&self, other: &Matrix, context: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(TptError::ShapeMismatch {
                context,
                expected: self.shape(),
                actual: other.shape(),
            });
        }
        Ok(())
    }
}

/// Max-shifted softmax of one row.
pub fn softmax(row: &[f64]) -> Vec<f64> {
    let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = row.iter().map(|x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Euclidean norm.
pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Returns `v / max(|v|, 1e-12)`.
pub fn normalize(v: &[f64]) -> Vec<f64> {
    let n = l2_norm(v).max(1e-12);
    v.iter().map(|x| x / n).collect()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl Mul for &Matrix {
    type Output = Matrix;

    fn mul(self, rhs: Self) -> Self::Output {
        if self.cols != rhs.rows {
            panic!("Matrices are of incorrect sizes")
        }

        let mut res =  Matrix::zeros(self.rows, rhs.cols);

        for i in 0..res.rows {
            for k in 0..self.cols {
                let a = self.data[i][k];
                if a == 0.0 {
                    continue;
                }
                for j in 0..res.cols {
                    res.data[i][j] += a * rhs.data[k][j];
                }
            }
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn softmax_rows_sum_to_one() {
        let m = Matrix::from_rows(vec![vec![1.0, 2.0, 3.0], vec![-5.0, 0.0, 5.0]]).unwrap();
        for row in m.softmax_rows().data {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        assert!(Matrix::from_rows(vec![vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    fn product_matches_hand_computation() {
        let a = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let c = &a * &b;
        assert_eq!(c.data, vec![vec![2.0, 1.0], vec![4.0, 3.0]]);
    }

    #[test]
    fn select_rows_keeps_requested_order() {
        let m = Matrix::from_rows(vec![vec![0.0], vec![1.0], vec![2.0]]).unwrap();
        assert_eq!(m.select_rows(&[2, 0]).data, vec![vec![2.0], vec![0.0]]);
    }
}
