use approx::assert_relative_eq;
use ndarray::{Array1, array};
use phylodiff::alignment::SitePatterns;
use phylodiff::branchrates::StrictClock;
use phylodiff::engine::DifferentialKind;
use phylodiff::gradient::{
    ApproximationMode, BoundGradient, GradientProvider, GradientTarget, SubstitutionModelGradient,
};
use phylodiff::maximize::{
    LaplaceApproximation, LaplaceMode, MaximizerOptions, MaximizerWrtParameter,
};
use phylodiff::substmodel::{GeneralizedLinearModel, GlmSubstitutionModel, SiteRateModel};
use phylodiff::tree::Tree;
use phylodiff::treedatalikelihood::{BranchModel, BranchRateGradient, TreeDataLikelihood};

/// Mostly invariant sites with a few informative ones, so the clock rate has an
/// interior maximum.
fn patterns() -> SitePatterns {
    let columns: [([usize; 8], f64); 8] = [
        ([0; 8], 20.0),
        ([1; 8], 15.0),
        ([2; 8], 15.0),
        ([3; 8], 20.0),
        ([1, 0, 0, 0, 0, 0, 0, 0], 3.0),
        ([0, 0, 0, 0, 2, 2, 2, 2], 2.0),
        ([3, 3, 0, 0, 0, 0, 0, 0], 2.0),
        ([0, 1, 2, 3, 0, 1, 2, 3], 1.0),
    ];
    let states = ndarray::Array2::from_shape_fn((8, columns.len()), |(tip, p)| columns[p].0[tip]);
    let weights = Array1::from_iter(columns.iter().map(|(_, w)| *w));
    SitePatterns::new(states, weights, 4).unwrap()
}

fn clock_likelihood(rate: f64) -> TreeDataLikelihood {
    let tree = Tree::balanced(8, 0.1).unwrap();
    let node_count = tree.node_count();
    let glm = GeneralizedLinearModel::new(6)
        .with_random_effects(array![0.0, 0.7, 0.0, 0.0, 0.7, 0.0])
        .unwrap();
    let model = GlmSubstitutionModel::new(4, array![0.25, 0.25, 0.25, 0.25], glm, true, true).unwrap();
    TreeDataLikelihood::new(
        tree,
        vec![model],
        BranchModel::homogeneous(node_count),
        Box::new(StrictClock::new(rate).unwrap()),
        SiteRateModel::homogeneous(),
        patterns(),
    )
    .unwrap()
}

fn clock_provider(rate: f64) -> BoundGradient<BranchRateGradient> {
    BoundGradient::new(clock_likelihood(rate), BranchRateGradient::new())
}

#[test]
fn maximizer_finds_a_stationary_clock_rate() {
    let start = clock_provider(1.0);
    let initial_gradient = clock_provider(1.0).gradient_log_density().unwrap();
    assert!(initial_gradient[0].abs() > 1e-3);

    let maximizer = MaximizerWrtParameter::new(MaximizerOptions {
        tolerance: 1e-8,
        max_iterations: 200,
    });
    let (mut provider, result) = maximizer.maximize(start).unwrap();
    assert!(result.parameters[0] > 0.0);
    assert!(result.gradient_norm < 1e-3, "|g| = {}", result.gradient_norm);
    assert_eq!(provider.parameter_values().to_vec(), result.parameters);
    assert!(result.log_likelihood >= clock_provider(1.0).log_likelihood().unwrap());

    let summary = LaplaceApproximation::new(LaplaceMode::Full)
        .approximate(&mut provider)
        .unwrap();
    assert_eq!(summary.standard_deviations.len(), 1);
    assert!(summary.standard_deviations[0] > 0.0 && summary.standard_deviations[0].is_finite());
    assert!(summary.log_marginal_likelihood.is_finite());
    assert_eq!(provider.parameter_values().to_vec(), result.parameters);

    // With one parameter the diagonal and full approximations coincide.
    let diagonal = LaplaceApproximation::new(LaplaceMode::Diagonal)
        .approximate(&mut provider)
        .unwrap();
    assert!(diagonal.covariance.is_none());
    assert_relative_eq!(
        diagonal.standard_deviations[0],
        summary.standard_deviations[0],
        max_relative = 1e-10
    );
    assert_eq!(provider.parameter_values().to_vec(), result.parameters);
}

#[test]
fn diagonal_laplace_differentiates_generator_gradients_numerically() {
    let likelihood = clock_likelihood(1.0);
    let gradient = SubstitutionModelGradient::new(
        &likelihood,
        0,
        GradientTarget::RandomEffects,
        DifferentialKind::Exact,
        ApproximationMode::FirstOrder,
    )
    .unwrap();
    let mut provider = BoundGradient::new(likelihood, gradient);
    let start = provider.parameter_values();

    let summary = LaplaceApproximation::new(LaplaceMode::Diagonal)
        .approximate(&mut provider)
        .unwrap();
    assert_eq!(summary.standard_deviations.len(), 6);
    assert_eq!(provider.parameter_values(), start);

    let h = 1e-5;
    for (k, sd) in summary.standard_deviations.iter().enumerate() {
        let mut shifted = start.clone();
        shifted[k] += h;
        provider.set_parameter_values(shifted.view()).unwrap();
        let up = provider.gradient_log_density().unwrap()[k];
        shifted[k] -= 2.0 * h;
        provider.set_parameter_values(shifted.view()).unwrap();
        let down = provider.gradient_log_density().unwrap()[k];
        let curvature = (up - down) / (2.0 * h);
        if curvature < 0.0 {
            assert_relative_eq!(*sd, (-1.0 / curvature).sqrt(), max_relative = 1e-3);
        } else {
            assert!(sd.is_nan());
        }
    }
    provider.set_parameter_values(start.view()).unwrap();
}
