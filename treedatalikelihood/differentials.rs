//! Differential matrices pushed into engine buffers.
//!
//! Buffer `m` holds model `m`'s generator blocked by rate category (`r_c Q` and
//! `r_c² Q²`); these give derivatives with respect to a branch's distance. Buffer
//! `model_count + node` holds `ρ_b Q` for one branch, unblocked, giving
//! derivatives with respect to the branch's length.

use super::{LikelihoodError, TreeDataLikelihood};
use crate::engine::DifferentialMatrices;
use crate::substmodel::SubstitutionModel;
use ndarray::{Array2, Array3};

impl TreeDataLikelihood {
    pub fn model_buffer(&self, model: usize) -> usize {
        model
    }

    pub fn branch_buffer(&self, node: usize) -> usize {
        self.models.len() + node
    }

    fn generator_checked(&self, model: usize) -> Result<Array2<f64>, LikelihoodError> {
        let q = self.models[model].infinitesimal_matrix();
        let n = self.engine.state_count();
        if q.nrows() != n || q.ncols() != n {
            return Err(LikelihoodError::DimensionMismatch {
                what: "generator matrix",
                expected: n,
                found: q.nrows(),
            });
        }
        Ok(q)
    }

    /// Caches `r_c Q` (and `r_c² Q²` when asked) per substitution model.
    pub fn cache_differentials(&mut self, want_second_order: bool) -> Result<(), LikelihoodError> {
        let rates = self.site_model.category_rates().to_owned();
        let n = self.engine.state_count();
        for model in 0..self.models.len() {
            let q = self.generator_checked(model)?;
            let first = Array3::from_shape_fn((rates.len(), n, n), |(c, i, j)| rates[c] * q[[i, j]]);
            let buffer = self.model_buffer(model);
            self.engine
                .cache_first_order_differential_matrix(buffer, DifferentialMatrices::PerCategory(first))?;
            if want_second_order {
                let q2 = q.dot(&q);
                let second = Array3::from_shape_fn((rates.len(), n, n), |(c, i, j)| {
                    rates[c] * rates[c] * q2[[i, j]]
                });
                self.engine.cache_second_order_differential_matrix(
                    buffer,
                    DifferentialMatrices::PerCategory(second),
                )?;
            }
        }
        log::debug!(
            "Cached {} differential buffer(s) over {} rate categories",
            self.models.len(),
            rates.len()
        );
        Ok(())
    }

    /// Caches `ρ_b Q_{model(b)}` (and its square) for every non-root branch.
    pub fn cache_branch_differentials(&mut self, want_second_order: bool) -> Result<(), LikelihoodError> {
        let generators = (0..self.models.len())
            .map(|m| self.generator_checked(m))
            .collect::<Result<Vec<_>, _>>()?;
        let squares: Vec<Array2<f64>> = if want_second_order {
            generators.iter().map(|q| q.dot(q)).collect()
        } else {
            Vec::new()
        };
        for node in self.branch_nodes() {
            let model = self.branch_model.model_for(node);
            let rate = self.branch_rates.branch_rate(&self.tree, node);
            let buffer = self.branch_buffer(node);
            self.engine.cache_first_order_differential_matrix(
                buffer,
                DifferentialMatrices::Branch(&generators[model] * rate),
            )?;
            if want_second_order {
                self.engine.cache_second_order_differential_matrix(
                    buffer,
                    DifferentialMatrices::Branch(&squares[model] * (rate * rate)),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::likelihood;
    use crate::engine::DifferentialMatrices;

    #[test]
    fn caching_twice_is_bit_identical() {
        let mut lik = likelihood();
        lik.ensure_partials().unwrap();
        lik.cache_differentials(true).unwrap();
        let first = lik.engine().first_order_differential_matrix(0).cloned().unwrap();
        let second = lik.engine().second_order_differential_matrix(0).cloned().unwrap();
        lik.cache_differentials(true).unwrap();
        assert_eq!(lik.engine().first_order_differential_matrix(0), Some(&first));
        assert_eq!(lik.engine().second_order_differential_matrix(0), Some(&second));
    }

    #[test]
    fn blocks_scale_by_category_rate() {
        let mut lik = likelihood();
        lik.cache_differentials(false).unwrap();
        let rates = lik.site_model().category_rates().to_owned();
        let q = crate::substmodel::SubstitutionModel::infinitesimal_matrix(&lik.models()[0]);
        match lik.engine().first_order_differential_matrix(0) {
            Some(DifferentialMatrices::PerCategory(blocks)) => {
                assert_eq!(blocks.shape(), &[2, 4, 4]);
                assert_eq!(blocks[[1, 0, 2]], rates[1] * q[[0, 2]]);
                // Row-major generator layout, never transposed.
                assert_eq!(blocks[[0, 2, 0]], rates[0] * q[[2, 0]]);
            }
            other => panic!("unexpected buffer {other:?}"),
        }
        assert!(lik.engine().second_order_differential_matrix(0).is_none());
    }

    #[test]
    fn branch_buffers_carry_branch_rate() {
        let mut lik = likelihood();
        lik.cache_branch_differentials(false).unwrap();
        let q = crate::substmodel::SubstitutionModel::infinitesimal_matrix(&lik.models()[0]);
        let buffer = lik.branch_buffer(2);
        match lik.engine().first_order_differential_matrix(buffer) {
            Some(DifferentialMatrices::Branch(m)) => {
                assert!((m[[1, 3]] - 1.3 * q[[1, 3]]).abs() < 1e-14);
            }
            other => panic!("unexpected buffer {other:?}"),
        }
    }
}
