//! TOML description of an analysis: data, models and what to differentiate.
//!
//! A config is plain data. [`AnalysisConfig::likelihood`] turns it into a
//! [`TreeDataLikelihood`], and [`AnalysisConfig::provider`] binds that context to the
//! requested gradient so the maximizer or the gradient check can drive it.

use crate::alignment::{Alignment, Alphabet, PatternError};
use crate::branchrates::{ArbitraryBranchRates, BranchRateError, BranchRateModel, RateTransform, StrictClock};
use crate::engine::DifferentialKind;
use crate::gradient::{
    ApproximationMode, BoundGradient, GradientError, GradientProvider, GradientTarget,
    SubstitutionModelGradient,
};
use crate::maximize::{LaplaceMode, MaximizerOptions};
use crate::substmodel::{
    FixedEffects, GeneralizedLinearModel, GlmSubstitutionModel, SiteRateModel, SubstModelError, rate_count,
};
use crate::transform::RatioGradient;
use crate::tree::{TreeError, newick};
use crate::treedatalikelihood::{
    BranchModel, BranchRateGradient, LikelihoodError, NodeHeightGradient, TreeDataLikelihood,
};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Invalid tree: {0}")]
    Tree(#[from] TreeError),

    #[error("Invalid alignment: {0}")]
    Pattern(#[from] PatternError),

    #[error("Invalid substitution model: {0}")]
    Model(#[from] SubstModelError),

    #[error("Invalid branch rates: {0}")]
    BranchRate(#[from] BranchRateError),

    #[error("Failed to build the likelihood: {0}")]
    Likelihood(#[from] LikelihoodError),

    #[error("Failed to set up the gradient: {0}")]
    Gradient(#[from] GradientError),

    #[error("Design matrix for block '{block}' is ragged: row {row} has {found} entries, expected {expected}")]
    RaggedDesign {
        block: String,
        row: usize,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub tree: TreeConfig,
    pub alignment: AlignmentConfig,
    /// One entry per substitution model; branches use model 0 unless reassigned.
    pub models: Vec<ModelConfig>,
    /// Model index per node, root included. Omitted means every branch uses model 0.
    #[serde(default)]
    pub branch_assignments: Option<Vec<usize>>,
    #[serde(default)]
    pub site_model: SiteModelConfig,
    pub branch_rates: BranchRatesConfig,
    pub gradient: GradientConfig,
    #[serde(default)]
    pub maximizer: MaximizerOptions,
    #[serde(default)]
    pub laplace: LaplaceMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    pub newick: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Defaults to `ACGT`.
    #[serde(default)]
    pub alphabet: Option<String>,
    pub sequences: Vec<SequenceConfig>,
    #[serde(default)]
    pub paired_sites: Vec<(usize, usize)>,
    /// Analyse a bootstrap replicate drawn with this seed instead of the data.
    #[serde(default)]
    pub bootstrap_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub taxon: String,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub frequencies: Vec<f64>,
    #[serde(default = "default_true")]
    pub symmetric: bool,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default)]
    pub fixed_effects: Vec<FixedEffectsConfig>,
    #[serde(default)]
    pub random_effects: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedEffectsConfig {
    pub name: String,
    /// Rows are rate entries, columns are predictors.
    pub design: Vec<Vec<f64>>,
    pub coefficients: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SiteModelConfig {
    #[default]
    Homogeneous,
    DiscreteGamma { shape: f64, categories: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BranchRatesConfig {
    Strict {
        rate: f64,
    },
    /// One value per non-root node in node order.
    Arbitrary {
        values: Vec<f64>,
        transform: RateTransform,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "parameter")]
pub enum GradientConfig {
    Substitution {
        #[serde(default)]
        model: usize,
        target: GradientTarget,
        kind: DifferentialKind,
        #[serde(default = "default_mode")]
        mode: ApproximationMode,
    },
    BranchRates,
    NodeHeights,
    Ratios {
        #[serde(default)]
        include_log_jacobian: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_mode() -> ApproximationMode {
    ApproximationMode::FirstOrder
}

impl AnalysisConfig {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn likelihood(&self) -> Result<TreeDataLikelihood, ConfigError> {
        let tree = newick::parse(&self.tree.newick)?;
        let alphabet = self
            .alignment
            .alphabet
            .as_deref()
            .map_or_else(Alphabet::nucleotides, Alphabet::new);
        let rows: Vec<(&str, &str)> = self
            .alignment
            .sequences
            .iter()
            .map(|s| (s.taxon.as_str(), s.sequence.as_str()))
            .collect();
        let mut alignment = Alignment::new(alphabet, rows.as_slice())?;
        if !self.alignment.paired_sites.is_empty() {
            alignment = alignment.with_paired_sites(self.alignment.paired_sites.clone())?;
        }
        let patterns = match self.alignment.bootstrap_seed {
            Some(seed) => alignment.bootstrap_patterns(&tree, &mut StdRng::seed_from_u64(seed))?,
            None => alignment.patterns(&tree)?,
        };
        log::info!(
            "Loaded {} taxa, {} sites in {} patterns",
            alignment.taxa().len(),
            alignment.site_count(),
            patterns.pattern_count()
        );

        let state_count = patterns.state_count();
        let models = self
            .models
            .iter()
            .map(|m| m.build(state_count))
            .collect::<Result<Vec<_>, _>>()?;
        let branch_model = match &self.branch_assignments {
            Some(assignments) => BranchModel::new(assignments.clone(), models.len())?,
            None => BranchModel::homogeneous(tree.node_count()),
        };
        let site_model = match self.site_model {
            SiteModelConfig::Homogeneous => SiteRateModel::homogeneous(),
            SiteModelConfig::DiscreteGamma { shape, categories } => {
                SiteRateModel::discrete_gamma(shape, categories)?
            }
        };
        let branch_rates: Box<dyn BranchRateModel> = match &self.branch_rates {
            BranchRatesConfig::Strict { rate } => Box::new(StrictClock::new(*rate)?),
            BranchRatesConfig::Arbitrary { values, transform } => Box::new(ArbitraryBranchRates::new(
                &tree,
                Array1::from(values.clone()),
                *transform,
            )?),
        };

        Ok(TreeDataLikelihood::new(
            tree,
            models,
            branch_model,
            branch_rates,
            site_model,
            patterns,
        )?)
    }

    /// The likelihood bound to the configured gradient.
    pub fn provider(&self) -> Result<Box<dyn GradientProvider>, ConfigError> {
        let likelihood = self.likelihood()?;
        let provider: Box<dyn GradientProvider> = match &self.gradient {
            GradientConfig::Substitution {
                model,
                target,
                kind,
                mode,
            } => {
                let gradient =
                    SubstitutionModelGradient::new(&likelihood, *model, target.clone(), *kind, *mode)?;
                Box::new(BoundGradient::new(likelihood, gradient))
            }
            GradientConfig::BranchRates => {
                Box::new(BoundGradient::new(likelihood, BranchRateGradient::new()))
            }
            GradientConfig::NodeHeights => {
                Box::new(BoundGradient::new(likelihood, NodeHeightGradient::new()))
            }
            GradientConfig::Ratios {
                include_log_jacobian,
            } => {
                let gradient = RatioGradient::new(likelihood.tree(), *include_log_jacobian);
                Box::new(BoundGradient::new(likelihood, gradient))
            }
        };
        Ok(provider)
    }
}

impl ModelConfig {
    fn build(&self, state_count: usize) -> Result<GlmSubstitutionModel, ConfigError> {
        let rates = rate_count(state_count, self.symmetric);
        let mut glm = GeneralizedLinearModel::new(rates);
        for block in &self.fixed_effects {
            glm = glm.with_fixed_effects(FixedEffects::new(
                block.name.clone(),
                block.design_matrix()?,
                Array1::from(block.coefficients.clone()),
            )?)?;
        }
        if let Some(values) = &self.random_effects {
            glm = glm.with_random_effects(Array1::from(values.clone()))?;
        }
        Ok(GlmSubstitutionModel::new(
            state_count,
            Array1::from(self.frequencies.clone()),
            glm,
            self.symmetric,
            self.normalize,
        )?)
    }
}

impl FixedEffectsConfig {
    fn design_matrix(&self) -> Result<Array2<f64>, ConfigError> {
        let columns = self.coefficients.len();
        let mut design = Array2::<f64>::zeros((self.design.len(), columns));
        for (row, values) in self.design.iter().enumerate() {
            if values.len() != columns {
                return Err(ConfigError::RaggedDesign {
                    block: self.name.clone(),
                    row,
                    expected: columns,
                    found: values.len(),
                });
            }
            for (column, &value) in values.iter().enumerate() {
                design[[row, column]] = value;
            }
        }
        Ok(design)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    pub(crate) fn example() -> AnalysisConfig {
        let identity = (0..6)
            .map(|i| (0..6).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        AnalysisConfig {
            tree: TreeConfig {
                newick: "((a:0.1,b:0.15):0.2,(c:0.1,d:0.05):0.25);".to_string(),
            },
            alignment: AlignmentConfig {
                alphabet: None,
                sequences: vec![
                    SequenceConfig {
                        taxon: "a".to_string(),
                        sequence: "ACGTACGTAAGG".to_string(),
                    },
                    SequenceConfig {
                        taxon: "b".to_string(),
                        sequence: "ACGTACGAAAGG".to_string(),
                    },
                    SequenceConfig {
                        taxon: "c".to_string(),
                        sequence: "ACTTACGTCAGC".to_string(),
                    },
                    SequenceConfig {
                        taxon: "d".to_string(),
                        sequence: "GCTTACGTCAGC".to_string(),
                    },
                ],
                paired_sites: Vec::new(),
                bootstrap_seed: None,
            },
            models: vec![ModelConfig {
                frequencies: vec![0.25, 0.25, 0.25, 0.25],
                symmetric: true,
                normalize: true,
                fixed_effects: vec![FixedEffectsConfig {
                    name: "exchangeabilities".to_string(),
                    design: identity,
                    coefficients: vec![0.1, 0.5, -0.2, 0.3, 0.0, 0.2],
                }],
                random_effects: None,
            }],
            branch_assignments: None,
            site_model: SiteModelConfig::DiscreteGamma {
                shape: 0.5,
                categories: 4,
            },
            branch_rates: BranchRatesConfig::Strict { rate: 1.0 },
            gradient: GradientConfig::Substitution {
                model: 0,
                target: GradientTarget::FixedEffect { block: None },
                kind: DifferentialKind::Exact,
                mode: ApproximationMode::FirstOrder,
            },
            maximizer: MaximizerOptions::default(),
            laplace: LaplaceMode::Diagonal,
        }
    }

    #[test]
    fn builds_a_finite_likelihood() {
        let mut likelihood = example().likelihood().unwrap();
        assert_eq!(likelihood.tree().external_node_count(), 4);
        assert!(likelihood.log_likelihood().unwrap().is_finite());
    }

    #[test]
    fn provider_exposes_the_configured_parameters() {
        let provider = example().provider().unwrap();
        assert_eq!(provider.dimension(), 6);
        let values = provider.parameter_values();
        assert_relative_eq!(values[1], 0.5);
    }

    #[test]
    fn parses_a_hand_written_file() {
        let text = r#"
            models = [{ frequencies = [0.25, 0.25, 0.25, 0.25], random_effects = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5] }]

            [tree]
            newick = "((a:0.1,b:0.1):0.1,c:0.2);"

            [alignment]
            sequences = [
                { taxon = "a", sequence = "ACGT" },
                { taxon = "b", sequence = "ACGA" },
                { taxon = "c", sequence = "TCGA" },
            ]

            [branch_rates]
            kind = "strict"
            rate = 1.0

            [gradient]
            parameter = "ratios"
        "#;
        let config: AnalysisConfig = toml::from_str(text).unwrap();
        assert_eq!(config.site_model, SiteModelConfig::Homogeneous);
        assert_eq!(
            config.gradient,
            GradientConfig::Ratios {
                include_log_jacobian: false
            }
        );
        assert_eq!(config.provider().unwrap().dimension(), 2);
    }

    #[test]
    fn rejects_a_ragged_design() {
        let mut config = example();
        config.models[0].fixed_effects[0].design[3].pop();
        assert!(matches!(
            config.likelihood(),
            Err(ConfigError::RaggedDesign { row: 3, .. })
        ));
    }

    #[test]
    fn bootstrap_keeps_the_site_count() {
        let mut config = example();
        config.alignment.bootstrap_seed = Some(7);
        let likelihood = config.likelihood().unwrap();
        assert_relative_eq!(likelihood.patterns().weights().sum(), 12.0);
    }
}
