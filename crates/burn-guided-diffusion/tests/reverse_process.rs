use burn_guided_diffusion::{
    BetaSchedule, Denoiser, DiffusionProcess, GaussianMixtureConfig, NoiseSource, Schedule,
    VarianceMode,
};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;

fn run(mode: VarianceMode, learned: bool, seed: u64) -> Vec<f32> {
    let device = Default::default();
    let schedule = Schedule::new(BetaSchedule::Linear, 100, 25).unwrap();
    let model = GaussianMixtureConfig::default()
        .with_learned_variance(learned)
        .init::<TestBackend>(schedule.original_betas(), &device)
        .unwrap();
    let process = DiffusionProcess::new(schedule, mode, model.capabilities()).unwrap();
    let mut noise = NoiseSource::seeded(seed);

    let shape = [4, 1, 4, 4];
    let mut x = noise.normal::<TestBackend, 4>(shape, &device);
    for t in process.schedule().reverse_indices() {
        let ts = process.model_timesteps::<TestBackend>(t, 4, &device).unwrap();
        let out = model.predict(x.clone(), ts, None);
        let z = noise.normal(shape, &device);
        x = process.reverse_step(x, t, &out, z).unwrap();
    }
    x.into_data().to_vec().unwrap()
}

fn sample_means(values: &[f32]) -> Vec<f32> {
    values.chunks(16).map(|c| c.iter().sum::<f32>() / 16.0).collect()
}

#[test]
fn test_unguided_samples_land_near_a_class_mean() {
    for mode in [VarianceMode::Beta, VarianceMode::BetaTilde] {
        let values = run(mode, false, 11);
        assert!(values.iter().all(|v| v.is_finite()));
        for m in sample_means(&values) {
            assert!(m.abs() > 0.2 && m.abs() < 0.8, "{mode:?}: sample mean {m}");
        }
    }
}

#[test]
fn test_learned_variance_run_is_finite() {
    let values = run(VarianceMode::Learned, true, 5);
    assert_eq!(values.len(), 64);
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn test_same_seed_reproduces_samples() {
    assert_eq!(
        run(VarianceMode::Beta, false, 3),
        run(VarianceMode::Beta, false, 3)
    );
}
