use burn::prelude::*;
use burn_guided_diffusion::NoiseSource;
use burn_guided_mcmc::{
    AcceptanceBounds, AnnealedHmcSampler, AnnealedTarget, CalibrationSettings, CorrectionSampler,
    CorrectionStats, McmcMethod, StepSize, StepSizeCalibrator, StepSizeTable,
};
use burn_ndarray::NdArray;
use proptest::prelude::*;

type TestBackend = NdArray<f32>;

/// Leaves samples untouched and reports `curve(h)` for every sample
struct CurveSampler {
    curve: fn(f64) -> f64,
}

impl CorrectionSampler<TestBackend> for CurveSampler {
    fn method(&self) -> McmcMethod {
        McmcMethod::Hmc
    }

    fn correct(
        &self,
        _target: &dyn AnnealedTarget<TestBackend>,
        x: Tensor<TestBackend, 4>,
        _t: usize,
        step_size: &StepSize,
        _n_steps: usize,
        _noise: &mut NoiseSource,
    ) -> burn_guided_mcmc::Result<(Tensor<TestBackend, 4>, CorrectionStats)> {
        let batch = x.dims()[0];
        let acceptance = (self.curve)(step_size.magnitude());
        Ok((
            x,
            CorrectionStats {
                per_sample: vec![acceptance; batch],
            },
        ))
    }
}

struct StandardNormal;

impl AnnealedTarget<TestBackend> for StandardNormal {
    fn score(
        &self,
        x: Tensor<TestBackend, 4>,
        _t: usize,
    ) -> burn_guided_mcmc::Result<Tensor<TestBackend, 4>> {
        Ok(x.neg())
    }
}

fn held_batch() -> Tensor<TestBackend, 4> {
    NoiseSource::seeded(0).normal([4, 1, 2, 2], &Default::default())
}

fn calibrate_curve(
    curve: fn(f64) -> f64,
    bounds: AcceptanceBounds,
    initial: f64,
    max_iter: usize,
) -> burn_guided_mcmc::CalibrationOutcome {
    let initial: StepSizeTable = [(0, StepSize::Scalar(initial))].into_iter().collect();
    let mut calibrator = StepSizeCalibrator::new(
        Box::new(CurveSampler { curve }),
        1,
        CalibrationSettings {
            bounds,
            max_iter,
            adjust_factor: 2.0,
        },
        initial,
    )
    .unwrap();
    calibrator
        .calibrate(&StandardNormal, held_batch(), 0, &mut NoiseSource::seeded(1))
        .unwrap();
    calibrator.into_outcome()
}

#[test]
fn test_hmc_acceptance_falls_with_step_size() {
    let sampler = AnnealedHmcSampler::new(0.9, 3, vec![1.0]).unwrap();
    let x: Tensor<TestBackend, 4> = NoiseSource::seeded(30).normal([256, 1, 2, 2], &Default::default());
    let acceptance: Vec<f64> = [0.2, 0.6, 1.4, 1.95]
        .into_iter()
        .map(|h| {
            let (_, stats) = sampler
                .correct(
                    &StandardNormal as &dyn AnnealedTarget<TestBackend>,
                    x.clone(),
                    0,
                    &StepSize::Scalar(h),
                    2,
                    &mut NoiseSource::seeded(31),
                )
                .unwrap();
            stats.mean()
        })
        .collect();
    for pair in acceptance.windows(2) {
        assert!(pair[1] <= pair[0] + 0.03, "acceptance not falling: {acceptance:?}");
    }
    assert!(acceptance[0] > 0.9);
    assert!(acceptance[3] < 0.3);
}

#[test]
fn test_calibrator_brackets_from_above_and_below() {
    let bounds = AcceptanceBounds::new(0.6, 0.8).unwrap();
    for initial in [1e-3, 50.0] {
        let outcome = calibrate_curve(|h| (-h).exp(), bounds, initial, 30);
        let record = &outcome.records[0];
        assert!(record.resolved, "initial {initial}: {record:?}");
        let h = outcome.table.require(0).unwrap().magnitude();
        assert!(bounds.contains((-h).exp()));
    }
}

#[test]
fn test_calibrator_flags_cliff_it_cannot_resolve() {
    let bounds = AcceptanceBounds::new(0.6, 0.8).unwrap();
    let outcome = calibrate_curve(|h| if h < 0.3 { 1.0 } else { 0.0 }, bounds, 0.1, 12);
    let record = &outcome.records[0];
    assert!(!record.resolved);
    assert_eq!(record.iterations, 12);
    assert!(!bounds.contains(record.acceptance));
    assert_eq!(record.step_sizes.len(), 12);
    assert!(outcome.table.contains(0));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn prop_calibrator_resolves_smooth_curve(
        lower in 0.05f64..0.9,
        width in 0.02f64..0.1,
        initial_exp in -3.0f64..1.0,
    ) {
        let bounds = AcceptanceBounds::new(lower, lower + width).unwrap();
        let outcome = calibrate_curve(|h| (-h).exp(), bounds, 10f64.powf(initial_exp), 40);
        let record = &outcome.records[0];
        prop_assert!(record.resolved, "{:?}", record);
        prop_assert!(record.iterations <= 40);
        prop_assert_eq!(record.resolved, bounds.contains(record.acceptance));
    }
}
