//! Strategy data for generator-parameter gradients.
//!
//! Every generator parameter acts on a set of generator entries through
//! `∂ log Q̃_ij / ∂θ = w`. A [`ParameterMap`] lists those `(row, col, w)` triples
//! per parameter; [`GradientTarget`] says which GLM quantity the parameters are
//! and builds the map from the model's current state.

use super::GradientError;
use crate::substmodel::{GlmSubstitutionModel, SubstitutionModel};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GradientTarget {
    /// Coefficients of one fixed-effect block. `None` picks the only block.
    FixedEffect {
        #[serde(default)]
        block: Option<usize>,
    },
    /// Entries of one design-matrix column, one parameter per rate. Rows whose
    /// mask entry is `false` are structurally fixed and get a zero gradient.
    DesignColumn {
        block: usize,
        column: usize,
        #[serde(default)]
        mask: Option<Vec<bool>>,
    },
    /// Per-rate random effects added to the linear predictor.
    RandomEffects,
    /// Equilibrium frequencies, through both the generator and the root.
    Frequencies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproximationMode {
    FirstOrder,
    AffineCorrected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMap {
    entries: Vec<Vec<(usize, usize, f64)>>,
}

impl ParameterMap {
    pub fn new(entries: Vec<Vec<(usize, usize, f64)>>) -> Self {
        Self { entries }
    }

    /// `weights[rate, k]` is `∂ log r_rate / ∂θ_k`. A symmetric rate drives both
    /// `(i, j)` and `(j, i)`.
    pub fn from_rate_weights(
        rate_entries: &[(usize, usize)],
        symmetric: bool,
        weights: ArrayView2<f64>,
    ) -> Self {
        let entries = weights
            .columns()
            .into_iter()
            .map(|column| {
                let mut list = Vec::new();
                for (&(i, j), &w) in rate_entries.iter().zip(column.iter()) {
                    if w == 0.0 {
                        continue;
                    }
                    list.push((i, j, w));
                    if symmetric {
                        list.push((j, i, w));
                    }
                }
                list
            })
            .collect();
        Self { entries }
    }

    pub fn dimension(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self, parameter: usize) -> &[(usize, usize, f64)] {
        &self.entries[parameter]
    }
}

impl GradientTarget {
    /// Resolves the fixed-effect block this target reads.
    pub fn block(&self, model: &GlmSubstitutionModel) -> Result<Option<usize>, GradientError> {
        let count = model.glm().fixed_effects().len();
        let block = match *self {
            GradientTarget::FixedEffect { block: Some(block) } => block,
            GradientTarget::FixedEffect { block: None } => match count {
                0 => {
                    return Err(GradientError::Unsupported(
                        "the model has no fixed-effect block".to_string(),
                    ));
                }
                1 => 0,
                _ => {
                    return Err(GradientError::Unsupported(format!(
                        "the model has {count} fixed-effect blocks; choose one explicitly"
                    )));
                }
            },
            GradientTarget::DesignColumn { block, .. } => block,
            GradientTarget::RandomEffects | GradientTarget::Frequencies => return Ok(None),
        };
        if block >= count {
            return Err(GradientError::Unsupported(format!(
                "fixed-effect block {block} does not exist; the model has {count}"
            )));
        }
        Ok(Some(block))
    }

    /// Checks the target against the model; run once at construction time.
    pub fn validate(&self, model: &GlmSubstitutionModel) -> Result<(), GradientError> {
        if let Some(block) = model.glm().fixed_effects().iter().find(|b| b.indicators().is_some()) {
            return Err(GradientError::Unsupported(format!(
                "fixed-effect block '{}' carries indicator variables",
                block.name()
            )));
        }
        let block = self.block(model)?;
        if let GradientTarget::DesignColumn { column, mask, .. } = self {
            let design = model.glm().fixed_effects()[block.unwrap_or(0)].design();
            if *column >= design.ncols() {
                return Err(GradientError::Unsupported(format!(
                    "design column {column} does not exist; the block has {}",
                    design.ncols()
                )));
            }
            if let Some(mask) = mask {
                if mask.len() != design.nrows() {
                    return Err(GradientError::DimensionMismatch {
                        expected: design.nrows(),
                        found: mask.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The entry map for the model's current state; `None` for frequencies, which
    /// enter the generator multiplicatively rather than through `log r`.
    pub fn parameter_map(
        &self,
        model: &GlmSubstitutionModel,
    ) -> Result<Option<ParameterMap>, GradientError> {
        let entries = model.rate_entries();
        let symmetric = model.is_symmetric();
        let map = match self {
            GradientTarget::FixedEffect { .. } => {
                let block = self.block(model)?.unwrap_or(0);
                let design = model.glm().fixed_effects()[block].design();
                ParameterMap::from_rate_weights(entries, symmetric, design)
            }
            GradientTarget::DesignColumn { column, mask, .. } => {
                let block = self.block(model)?.unwrap_or(0);
                let beta = model.glm().fixed_effects()[block].coefficients()[*column];
                let rates = entries.len();
                let mut weights = ndarray::Array2::<f64>::zeros((rates, rates));
                for r in 0..rates {
                    let included = mask.as_ref().is_none_or(|m| m[r]);
                    if included {
                        weights[[r, r]] = beta;
                    }
                }
                ParameterMap::from_rate_weights(entries, symmetric, weights.view())
            }
            GradientTarget::RandomEffects => {
                let identity = ndarray::Array2::<f64>::eye(entries.len());
                ParameterMap::from_rate_weights(entries, symmetric, identity.view())
            }
            GradientTarget::Frequencies => return Ok(None),
        };
        Ok(Some(map))
    }

    pub fn dimension(&self, model: &GlmSubstitutionModel) -> usize {
        match self {
            GradientTarget::FixedEffect { .. } => self
                .block(model)
                .ok()
                .flatten()
                .map_or(0, |b| model.glm().fixed_effects()[b].column_count()),
            GradientTarget::DesignColumn { .. } | GradientTarget::RandomEffects => model.rate_count(),
            GradientTarget::Frequencies => model.state_count(),
        }
    }

    pub fn values(&self, model: &GlmSubstitutionModel) -> Array1<f64> {
        let block = self.block(model).ok().flatten();
        match (self, block) {
            (GradientTarget::FixedEffect { .. }, Some(b)) => {
                model.glm().fixed_effects()[b].coefficients().to_owned()
            }
            (GradientTarget::DesignColumn { column, .. }, Some(b)) => {
                model.glm().fixed_effects()[b].design().column(*column).to_owned()
            }
            (GradientTarget::RandomEffects, _) => model
                .glm()
                .random_effects()
                .map_or_else(|| Array1::zeros(model.rate_count()), |v| v.to_owned()),
            (GradientTarget::Frequencies, _) => model.frequencies().to_owned(),
            _ => Array1::zeros(0),
        }
    }

    pub fn set_values(
        &self,
        model: &mut GlmSubstitutionModel,
        values: ArrayView1<f64>,
    ) -> Result<(), GradientError> {
        match self {
            GradientTarget::FixedEffect { .. } => {
                let block = self.block(model)?.unwrap_or(0);
                model.set_coefficients(block, values)?;
            }
            GradientTarget::DesignColumn { column, .. } => {
                let block = self.block(model)?.unwrap_or(0);
                model.set_design_column(block, *column, values)?;
            }
            GradientTarget::RandomEffects => model.set_random_effects(values)?,
            GradientTarget::Frequencies => model.set_frequencies(values)?,
        }
        Ok(())
    }
}
