//! Eigensystems of generator matrices.
//!
//! Reversible generators are symmetrised with `Π^{1/2} Q Π^{-1/2}` and solved with
//! `Eigh`, so their spectrum is real. General generators go through `Eig` and may
//! carry complex-conjugate pairs; every consumer works in complex arithmetic and
//! keeps the real part of the final result.

use super::SubstModelError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::{Eig, Eigh, Inverse, UPLO, c64};

/// Below this magnitude `(e^x - 1) / x` is evaluated from its Taylor series.
const EXPREL_SERIES_CUTOFF: f64 = 1e-5;

#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    values: Array1<c64>,
    vectors: Array2<c64>,
    inverse_vectors: Array2<c64>,
}

impl EigenDecomposition {
    /// Decomposes a generator satisfying detailed balance with respect to `pi`.
    pub fn reversible(q: ArrayView2<f64>, pi: ArrayView1<f64>) -> Result<Self, SubstModelError> {
        let n = q.nrows();
        if q.ncols() != n {
            return Err(SubstModelError::DimensionMismatch {
                what: "generator columns",
                expected: n,
                found: q.ncols(),
            });
        }
        if pi.len() != n {
            return Err(SubstModelError::DimensionMismatch {
                what: "frequencies",
                expected: n,
                found: pi.len(),
            });
        }
        let sqrt_pi = pi.mapv(f64::sqrt);
        let mut s = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                s[[i, j]] = sqrt_pi[i] * q[[i, j]] / sqrt_pi[j];
            }
        }
        // Average out rounding so `Eigh` sees an exactly symmetric matrix.
        let s = (&s + &s.t()) * 0.5;
        let (values, eigenvectors) = s
            .eigh(UPLO::Lower)
            .map_err(SubstModelError::EigendecompositionFailed)?;

        let mut vectors = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                vectors[[i, j]] = eigenvectors[[i, j]] / sqrt_pi[i];
            }
        }
        // V⁻¹ = Uᵀ Π^{1/2} for orthonormal U.
        let mut inverse = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                inverse[[i, j]] = eigenvectors[[j, i]] * sqrt_pi[j];
            }
        }
        Ok(Self {
            values: values.mapv(|v| c64::new(v, 0.0)),
            vectors: vectors.mapv(|v| c64::new(v, 0.0)),
            inverse_vectors: inverse.mapv(|v| c64::new(v, 0.0)),
        })
    }

    /// Decomposes an arbitrary generator.
    pub fn general(q: ArrayView2<f64>) -> Result<Self, SubstModelError> {
        let n = q.nrows();
        if q.ncols() != n {
            return Err(SubstModelError::DimensionMismatch {
                what: "generator columns",
                expected: n,
                found: q.ncols(),
            });
        }
        let (values, vectors) = q
            .to_owned()
            .eig()
            .map_err(SubstModelError::EigendecompositionFailed)?;
        let inverse_vectors = vectors
            .inv()
            .map_err(SubstModelError::EigendecompositionFailed)?;
        Ok(Self {
            values,
            vectors,
            inverse_vectors,
        })
    }

    pub fn state_count(&self) -> usize {
        self.values.len()
    }

    pub fn eigenvalues(&self) -> ArrayView1<'_, c64> {
        self.values.view()
    }

    /// Right eigenvectors as columns.
    pub fn eigenvectors(&self) -> ArrayView2<'_, c64> {
        self.vectors.view()
    }

    pub fn inverse_eigenvectors(&self) -> ArrayView2<'_, c64> {
        self.inverse_vectors.view()
    }

    /// `exp(Q t)` assembled as `V diag(e^{λt}) V⁻¹`.
    pub fn transition_probabilities(&self, distance: f64) -> Array2<f64> {
        let n = self.state_count();
        let mut scaled = self.vectors.clone();
        for (m, mut column) in scaled.columns_mut().into_iter().enumerate() {
            let factor = (self.values[m] * distance).exp();
            column.mapv_inplace(|v| v * factor);
        }
        let product = scaled.dot(&self.inverse_vectors);
        let mut p = Array2::<f64>::zeros((n, n));
        for ((i, j), value) in product.indexed_iter() {
            p[[i, j]] = value.re;
        }
        p
    }

    /// `∫₀ˢ e^{λ_m (s-u)} e^{λ_n u} du`, the kernel of the exact derivative of
    /// `exp(Qs)` with respect to a single generator entry.
    pub fn exp_integral(&self, m: usize, n: usize, s: f64) -> c64 {
        let lambda_m = self.values[m];
        let lambda_n = self.values[n];
        (lambda_n * s).exp() * s * exprel((lambda_m - lambda_n) * s)
    }
}

/// `(e^x - 1) / x`, continuous through `x = 0`.
pub fn exprel(x: c64) -> c64 {
    if x.norm() < EXPREL_SERIES_CUTOFF {
        c64::new(1.0, 0.0) + x / 2.0 + x * x / 6.0
    } else {
        (x.exp() - 1.0) / x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn hky_like() -> (Array2<f64>, Array1<f64>) {
        let pi = array![0.1, 0.2, 0.3, 0.4];
        let rates = [
            [0.0, 1.0, 4.0, 1.0],
            [1.0, 0.0, 1.0, 4.0],
            [4.0, 1.0, 0.0, 1.0],
            [1.0, 4.0, 1.0, 0.0],
        ];
        let mut q = Array2::<f64>::zeros((4, 4));
        for i in 0..4 {
            for j in 0..4 {
                if i != j {
                    q[[i, j]] = rates[i][j] * pi[j];
                }
            }
            let row: f64 = q.row(i).sum();
            q[[i, i]] = -row;
        }
        (q, pi)
    }

    #[test]
    fn reversible_decomposition_reconstructs_generator() {
        let (q, pi) = hky_like();
        let eigen = EigenDecomposition::reversible(q.view(), pi.view()).unwrap();
        let v = eigen.eigenvectors();
        let vi = eigen.inverse_eigenvectors();
        for i in 0..4 {
            for j in 0..4 {
                let mut sum = c64::new(0.0, 0.0);
                for m in 0..4 {
                    sum += v[[i, m]] * eigen.eigenvalues()[m] * vi[[m, j]];
                }
                assert_abs_diff_eq!(sum.re, q[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn transition_rows_sum_to_one_and_reach_stationarity() {
        let (q, pi) = hky_like();
        let eigen = EigenDecomposition::reversible(q.view(), pi.view()).unwrap();
        let p = eigen.transition_probabilities(0.3);
        for row in p.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        let far = eigen.transition_probabilities(200.0);
        for i in 0..4 {
            for j in 0..4 {
                assert_abs_diff_eq!(far[[i, j]], pi[j], epsilon = 1e-8);
            }
        }
        let zero = eigen.transition_probabilities(0.0);
        for i in 0..4 {
            assert_abs_diff_eq!(zero[[i, i]], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn general_and_reversible_agree() {
        let (q, pi) = hky_like();
        let reversible = EigenDecomposition::reversible(q.view(), pi.view()).unwrap();
        let general = EigenDecomposition::general(q.view()).unwrap();
        let a = reversible.transition_probabilities(0.7);
        let b = general.transition_probabilities(0.7);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn exprel_is_continuous_at_zero() {
        let tiny = exprel(c64::new(1e-7, 0.0));
        let small = exprel(c64::new(2e-5, 0.0));
        assert_abs_diff_eq!(tiny.re, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(small.re, ((2e-5f64).exp() - 1.0) / 2e-5, epsilon = 1e-9);
    }

    #[test]
    fn exp_integral_on_ties_is_s_times_exponential() {
        let (q, pi) = hky_like();
        let eigen = EigenDecomposition::reversible(q.view(), pi.view()).unwrap();
        let s = 0.4;
        let lambda = eigen.eigenvalues()[1];
        let value = eigen.exp_integral(1, 1, s);
        assert_abs_diff_eq!(value.re, s * (lambda.re * s).exp(), epsilon = 1e-12);
    }
}
