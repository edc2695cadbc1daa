//! Affine correction of raw cross-product differentials.
//!
//! Each row of `Q` sums to zero, so the diagonal is a linear function of the
//! off-diagonal entries and the raw differential `Z = ∂ℓ/∂Q` carries a component
//! along the zero-eigenvalue eigenspace that no admissible perturbation of `Q`
//! can reach. With `Q = VΛV⁻¹`, the projector `P = V diag(1[λ≠0]) V⁻¹` (written
//! `QQ⁺` elsewhere) removes it: the corrected differential is `PZ`.

use super::GradientError;
use crate::substmodel::{EigenDecomposition, SubstitutionModel};
use crate::treedatalikelihood::TreeDataLikelihood;
use ndarray::Array2;
use ndarray_linalg::c64;

#[derive(Debug, Clone)]
pub struct AffineCorrection {
    /// Substitution-model and branch-model versions the projector was built for.
    key: Option<(u64, u64)>,
    projector: Array2<f64>,
}

impl Default for AffineCorrection {
    fn default() -> Self {
        Self {
            key: None,
            projector: Array2::zeros((0, 0)),
        }
    }
}

impl AffineCorrection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current projector, empty until the first correction.
    pub fn projector(&self) -> &Array2<f64> {
        &self.projector
    }

    pub fn correct(
        &mut self,
        likelihood: &TreeDataLikelihood,
        model: usize,
        cross_products: &Array2<f64>,
    ) -> Result<Array2<f64>, GradientError> {
        let substitution_model = likelihood.model(model)?;
        let key = (substitution_model.version(), likelihood.branch_model().version());
        if self.key != Some(key) {
            let eigen = substitution_model.eigen_decomposition()?;
            log::debug!(
                "Rebuilding affine projector for model {model} (version {}, branch model version {})",
                key.0,
                key.1
            );
            self.projector = nonzero_eigenspace_projector(&eigen);
            self.key = Some(key);
        }
        if self.projector.dim() != cross_products.dim() {
            return Err(GradientError::DimensionMismatch {
                expected: self.projector.nrows(),
                found: cross_products.nrows(),
            });
        }
        Ok(self.projector.dot(cross_products))
    }
}

/// Index of the eigenvalue closest to zero.
pub(crate) fn zero_eigenvalue(eigen: &EigenDecomposition) -> usize {
    eigen
        .eigenvalues()
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.norm().total_cmp(&b.norm()))
        .map_or(0, |(index, _)| index)
}

/// `V diag(1[λ≠0]) V⁻¹`, real part.
fn nonzero_eigenspace_projector(eigen: &EigenDecomposition) -> Array2<f64> {
    let zero = zero_eigenvalue(eigen);
    let mut kept = eigen.eigenvectors().to_owned();
    kept.column_mut(zero).fill(c64::new(0.0, 0.0));
    kept.dot(&eigen.inverse_eigenvectors()).mapv(|value| value.re)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::SitePatterns;
    use crate::branchrates::StrictClock;
    use crate::engine::DifferentialKind;
    use crate::substmodel::SiteRateModel;
    use crate::tree::Tree;
    use crate::treedatalikelihood::test_fixtures::symmetric_model;
    use crate::treedatalikelihood::{BranchModel, SubstitutionModelCrossProductDelegate};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn uniform_likelihood(branch_length: f64) -> TreeDataLikelihood {
        let tree = Tree::balanced(4, branch_length).unwrap();
        let patterns = SitePatterns::new(
            array![[0, 1, 2, 3], [0, 1, 2, 2], [1, 3, 2, 0], [0, 3, 1, 0]],
            array![2.0, 1.0, 3.0, 1.0],
            4,
        )
        .unwrap();
        let node_count = tree.node_count();
        TreeDataLikelihood::new(
            tree,
            vec![symmetric_model(true)],
            BranchModel::homogeneous(node_count),
            Box::new(StrictClock::new(1.0).unwrap()),
            SiteRateModel::homogeneous(),
            patterns,
        )
        .unwrap()
    }

    #[test]
    fn projector_is_idempotent_and_fixes_the_generator() {
        let model = symmetric_model(true);
        let p = nonzero_eigenspace_projector(&model.eigen_decomposition().unwrap());
        let q = model.infinitesimal_matrix();
        for (a, b) in p.dot(&p).iter().zip(p.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        for (a, b) in p.dot(&q).iter().zip(q.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        // The constant vector spans the zero eigenspace of a generator.
        for value in p.dot(&Array1::<f64>::ones(4)).iter() {
            assert_abs_diff_eq!(*value, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn corrected_differential_has_no_zero_eigenvalue_component() {
        let mut lik = uniform_likelihood(0.25);
        let raw = SubstitutionModelCrossProductDelegate::new(DifferentialKind::FirstOrder)
            .gradient(&mut lik)
            .unwrap();
        let mut affine = AffineCorrection::new();
        let corrected = affine.correct(&lik, 0, &raw.per_model[0]).unwrap();

        let eigen = lik.model(0).unwrap().eigen_decomposition().unwrap();
        let zero = zero_eigenvalue(&eigen);
        assert!(eigen.eigenvalues()[zero].norm() < 1e-10);
        let left = eigen.inverse_eigenvectors().row(zero).to_owned();
        let complexify = |z: &Array2<f64>| z.mapv(|v| c64::new(v, 0.0));
        let before = left.dot(&complexify(&raw.per_model[0]));
        let after = left.dot(&complexify(&corrected));
        assert!(before.iter().any(|v| v.norm() > 1e-6));
        for value in after.iter() {
            assert!(value.norm() < 1e-10, "{value}");
        }
    }

    #[test]
    fn projector_does_not_depend_on_branch_distances() {
        let short = uniform_likelihood(0.25);
        let long = uniform_likelihood(2.0);
        let z = Array2::from_shape_fn((4, 4), |(i, j)| (1 + i * 4 + j) as f64);
        let mut a = AffineCorrection::new();
        let mut b = AffineCorrection::new();
        let corrected_short = a.correct(&short, 0, &z).unwrap();
        let corrected_long = b.correct(&long, 0, &z).unwrap();
        assert_eq!(a.projector(), b.projector());
        assert_eq!(corrected_short, corrected_long);
    }

    #[test]
    fn projector_is_rebuilt_when_a_model_changes() {
        let mut lik = uniform_likelihood(0.25);
        let mut affine = AffineCorrection::new();
        let z = Array2::<f64>::eye(4);
        affine.correct(&lik, 0, &z).unwrap();
        let first_key = affine.key;
        affine.correct(&lik, 0, &z).unwrap();
        assert_eq!(affine.key, first_key);

        lik.branch_model_mut().set_model(1, 0).unwrap();
        affine.correct(&lik, 0, &z).unwrap();
        assert_ne!(affine.key, first_key);
        let branch_key = affine.key;

        lik.model_mut(0)
            .unwrap()
            .set_frequencies(array![0.1, 0.3, 0.3, 0.3].view())
            .unwrap();
        let rebuilt = affine.correct(&lik, 0, &z).unwrap();
        assert_ne!(affine.key, branch_key);
        assert_eq!(&rebuilt, affine.projector());
    }

    #[test]
    fn mismatched_cross_products_are_rejected() {
        let lik = uniform_likelihood(0.25);
        let mut affine = AffineCorrection::new();
        let result = affine.correct(&lik, 0, &Array2::zeros((3, 3)));
        assert!(matches!(result, Err(GradientError::DimensionMismatch { .. })));
    }
}
