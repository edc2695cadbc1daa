//! Log-additive (GLM) generator parameterisation.
//!
//! Each free off-diagonal rate `r_k` is `exp(η_k)` with
//! `η = Σ_blocks X_b (β_b ∘ δ_b) + ε`, where `X_b` are design matrices with one row
//! per rate entry, `δ_b` optional indicator variables and `ε` optional random
//! effects. The generator is `Q̃_ij = r_k π_j`, optionally divided by the expected
//! substitution rate `μ = Σ_i π_i Σ_{j≠i} Q̃_ij`.

use super::{EigenDecomposition, SubstModelError, SubstitutionModel, rate_count, rate_entries};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::cell::RefCell;

/// Largest accepted deviation of `Σ π` from one. Wide enough for the steps of a
/// central difference taken coordinate by coordinate.
pub const FREQUENCY_SUM_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone)]
pub struct FixedEffects {
    name: String,
    design: Array2<f64>,
    coefficients: Array1<f64>,
    indicators: Option<Array1<f64>>,
}

impl FixedEffects {
    pub fn new(
        name: impl Into<String>,
        design: Array2<f64>,
        coefficients: Array1<f64>,
    ) -> Result<Self, SubstModelError> {
        if design.ncols() != coefficients.len() {
            return Err(SubstModelError::DimensionMismatch {
                what: "fixed-effect coefficients",
                expected: design.ncols(),
                found: coefficients.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            design,
            coefficients,
            indicators: None,
        })
    }

    /// Attaches 0/1 inclusion indicators (Bayesian stochastic search variable selection).
    pub fn with_indicators(mut self, indicators: Array1<f64>) -> Result<Self, SubstModelError> {
        if indicators.len() != self.coefficients.len() {
            return Err(SubstModelError::DimensionMismatch {
                what: "indicator variables",
                expected: self.coefficients.len(),
                found: indicators.len(),
            });
        }
        self.indicators = Some(indicators);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn design(&self) -> ArrayView2<'_, f64> {
        self.design.view()
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    pub fn indicators(&self) -> Option<ArrayView1<'_, f64>> {
        self.indicators.as_ref().map(|i| i.view())
    }

    pub fn column_count(&self) -> usize {
        self.design.ncols()
    }

    /// `X (β ∘ δ)`.
    pub fn linear_predictor(&self) -> Array1<f64> {
        match &self.indicators {
            Some(delta) => self.design.dot(&(&self.coefficients * delta)),
            None => self.design.dot(&self.coefficients),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneralizedLinearModel {
    rate_count: usize,
    fixed_effects: Vec<FixedEffects>,
    random_effects: Option<Array1<f64>>,
}

impl GeneralizedLinearModel {
    pub fn new(rate_count: usize) -> Self {
        Self {
            rate_count,
            fixed_effects: Vec::new(),
            random_effects: None,
        }
    }

    pub fn with_fixed_effects(mut self, block: FixedEffects) -> Result<Self, SubstModelError> {
        if block.design.nrows() != self.rate_count {
            return Err(SubstModelError::DimensionMismatch {
                what: "design-matrix rows",
                expected: self.rate_count,
                found: block.design.nrows(),
            });
        }
        self.fixed_effects.push(block);
        Ok(self)
    }

    pub fn with_random_effects(mut self, values: Array1<f64>) -> Result<Self, SubstModelError> {
        if values.len() != self.rate_count {
            return Err(SubstModelError::DimensionMismatch {
                what: "random effects",
                expected: self.rate_count,
                found: values.len(),
            });
        }
        self.random_effects = Some(values);
        Ok(self)
    }

    /// Lumped rates: entry `k` shares the log-rate of `groups[k]`.
    pub fn grouped(
        groups: &[usize],
        group_log_rates: Array1<f64>,
    ) -> Result<Self, SubstModelError> {
        let group_count = group_log_rates.len();
        let mut design = Array2::<f64>::zeros((groups.len(), group_count));
        for (entry, &group) in groups.iter().enumerate() {
            if group >= group_count {
                return Err(SubstModelError::DimensionMismatch {
                    what: "rate group index",
                    expected: group_count,
                    found: group,
                });
            }
            design[[entry, group]] = 1.0;
        }
        let block = FixedEffects::new("groups", design, group_log_rates)?;
        Self::new(groups.len()).with_fixed_effects(block)
    }

    pub fn rate_count(&self) -> usize {
        self.rate_count
    }

    pub fn fixed_effects(&self) -> &[FixedEffects] {
        &self.fixed_effects
    }

    pub fn random_effects(&self) -> Option<ArrayView1<'_, f64>> {
        self.random_effects.as_ref().map(|r| r.view())
    }

    pub fn log_rates(&self) -> Array1<f64> {
        let mut eta = Array1::<f64>::zeros(self.rate_count);
        for block in &self.fixed_effects {
            eta += &block.linear_predictor();
        }
        if let Some(epsilon) = &self.random_effects {
            eta += epsilon;
        }
        eta
    }

    fn block_mut(&mut self, block: usize) -> Result<&mut FixedEffects, SubstModelError> {
        self.fixed_effects
            .get_mut(block)
            .ok_or(SubstModelError::UnknownBlock(block))
    }
}

#[derive(Debug, Clone)]
pub struct GlmSubstitutionModel {
    state_count: usize,
    symmetric: bool,
    normalize: bool,
    glm: GeneralizedLinearModel,
    frequencies: Array1<f64>,
    entries: Vec<(usize, usize)>,
    version: u64,
    eigen_cache: RefCell<Option<(u64, EigenDecomposition)>>,
}

impl GlmSubstitutionModel {
    pub fn new(
        state_count: usize,
        frequencies: Array1<f64>,
        glm: GeneralizedLinearModel,
        symmetric: bool,
        normalize: bool,
    ) -> Result<Self, SubstModelError> {
        let expected = rate_count(state_count, symmetric);
        if glm.rate_count() != expected {
            return Err(SubstModelError::DimensionMismatch {
                what: "GLM rate count",
                expected,
                found: glm.rate_count(),
            });
        }
        validate_frequencies(frequencies.view(), state_count)?;
        Ok(Self {
            state_count,
            symmetric,
            normalize,
            glm,
            frequencies,
            entries: rate_entries(state_count, symmetric),
            version: 0,
            eigen_cache: RefCell::new(None),
        })
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn is_normalized(&self) -> bool {
        self.normalize
    }

    pub fn glm(&self) -> &GeneralizedLinearModel {
        &self.glm
    }

    pub fn rate_entries(&self) -> &[(usize, usize)] {
        &self.entries
    }

    pub fn rate_count(&self) -> usize {
        self.entries.len()
    }

    pub fn rates(&self) -> Array1<f64> {
        self.glm.log_rates().mapv(f64::exp)
    }

    /// `Q̃` before normalisation.
    pub fn unnormalized_matrix(&self) -> Array2<f64> {
        let n = self.state_count;
        let pi = &self.frequencies;
        let rates = self.rates();
        let mut q = Array2::<f64>::zeros((n, n));
        for (&(i, j), &rate) in self.entries.iter().zip(rates.iter()) {
            q[[i, j]] = rate * pi[j];
            if self.symmetric {
                q[[j, i]] = rate * pi[i];
            }
        }
        for i in 0..n {
            let off_diagonal: f64 = q.row(i).sum();
            q[[i, i]] = -off_diagonal;
        }
        q
    }

    /// Expected substitution rate `μ = Σ_i π_i (−Q̃_ii)`.
    pub fn normalization_constant(&self) -> f64 {
        let q = self.unnormalized_matrix();
        (0..self.state_count)
            .map(|i| -self.frequencies[i] * q[[i, i]])
            .sum()
    }

    pub fn set_coefficients(
        &mut self,
        block: usize,
        values: ArrayView1<f64>,
    ) -> Result<(), SubstModelError> {
        let target = self.glm.block_mut(block)?;
        if values.len() != target.coefficients.len() {
            return Err(SubstModelError::DimensionMismatch {
                what: "fixed-effect coefficients",
                expected: target.coefficients.len(),
                found: values.len(),
            });
        }
        target.coefficients.assign(&values);
        self.fire_changed();
        Ok(())
    }

    pub fn set_design_column(
        &mut self,
        block: usize,
        column: usize,
        values: ArrayView1<f64>,
    ) -> Result<(), SubstModelError> {
        let target = self.glm.block_mut(block)?;
        if column >= target.design.ncols() {
            return Err(SubstModelError::DimensionMismatch {
                what: "design column",
                expected: target.design.ncols(),
                found: column,
            });
        }
        if values.len() != target.design.nrows() {
            return Err(SubstModelError::DimensionMismatch {
                what: "design-matrix rows",
                expected: target.design.nrows(),
                found: values.len(),
            });
        }
        target.design.column_mut(column).assign(&values);
        self.fire_changed();
        Ok(())
    }

    pub fn set_random_effects(&mut self, values: ArrayView1<f64>) -> Result<(), SubstModelError> {
        if values.len() != self.rate_count() {
            return Err(SubstModelError::DimensionMismatch {
                what: "random effects",
                expected: self.rate_count(),
                found: values.len(),
            });
        }
        self.glm.random_effects = Some(values.to_owned());
        self.fire_changed();
        Ok(())
    }

    /// Frequencies must be positive and sum to one within [`FREQUENCY_SUM_TOLERANCE`].
    /// They are stored as given, not renormalised.
    pub fn set_frequencies(&mut self, values: ArrayView1<f64>) -> Result<(), SubstModelError> {
        validate_frequencies(values, self.state_count)?;
        self.frequencies.assign(&values);
        self.fire_changed();
        Ok(())
    }

    fn fire_changed(&mut self) {
        self.version += 1;
        self.eigen_cache.replace(None);
    }
}

impl SubstitutionModel for GlmSubstitutionModel {
    fn state_count(&self) -> usize {
        self.state_count
    }

    fn infinitesimal_matrix(&self) -> Array2<f64> {
        let q = self.unnormalized_matrix();
        if self.normalize {
            let mu = self.normalization_constant();
            q / mu
        } else {
            q
        }
    }

    fn frequencies(&self) -> ArrayView1<'_, f64> {
        self.frequencies.view()
    }

    fn eigen_decomposition(&self) -> Result<EigenDecomposition, SubstModelError> {
        if let Some((version, eigen)) = self.eigen_cache.borrow().as_ref() {
            if *version == self.version {
                return Ok(eigen.clone());
            }
        }
        let rates = self.rates();
        if let Some((index, &value)) = rates.iter().enumerate().find(|(_, r)| !r.is_finite()) {
            return Err(SubstModelError::NonFiniteRate { index, value });
        }
        let q = self.infinitesimal_matrix();
        let eigen = if self.symmetric {
            EigenDecomposition::reversible(q.view(), self.frequencies.view())?
        } else {
            EigenDecomposition::general(q.view())?
        };
        log::debug!(
            "Rebuilt {}-state eigensystem at model version {}",
            self.state_count,
            self.version
        );
        self.eigen_cache.replace(Some((self.version, eigen.clone())));
        Ok(eigen)
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn validate_frequencies(values: ArrayView1<f64>, state_count: usize) -> Result<(), SubstModelError> {
    if values.len() != state_count {
        return Err(SubstModelError::DimensionMismatch {
            what: "frequencies",
            expected: state_count,
            found: values.len(),
        });
    }
    if let Some(bad) = values.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
        return Err(SubstModelError::InvalidFrequencies(format!(
            "every frequency must be positive and finite, found {bad}"
        )));
    }
    let total = values.sum();
    if (total - 1.0).abs() > FREQUENCY_SUM_TOLERANCE {
        return Err(SubstModelError::InvalidFrequencies(format!(
            "frequencies must sum to one, found {total}"
        )));
    }
    Ok(())
}
