use burn::backend::Autodiff;
use burn::prelude::*;
use burn_guided::diffusion::{
    BetaSchedule, Classifier, Denoiser, DenoiserCapabilities, DenoiserOutput, DiffusionProcess,
    GaussianMixtureConfig, GaussianMixtureModel, NoiseSource, Schedule, VarianceMode,
};
use burn_guided::mcmc::{
    AnnealedHmcSampler, AnnealedLangevinSampler, AnnealedTarget, BatchingStrategy, Corrector,
    FixedStepCorrector, StepSize, StepSizeTable,
};
use burn_guided::metrics::{accuracy, logits_to_label};
use burn_guided::{ClassifierFullGuidance, Guidance, GuidedSampler, NoGuidance, SampleRequest};
use burn_ndarray::NdArray;
use std::cell::Cell;

type TestBackend = Autodiff<NdArray<f32>>;

/// Mixture denoiser that counts its forward passes
struct CountingDenoiser {
    inner: GaussianMixtureModel<TestBackend>,
    calls: Cell<usize>,
}

impl CountingDenoiser {
    fn new(inner: GaussianMixtureModel<TestBackend>) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }
}

impl Denoiser<TestBackend> for CountingDenoiser {
    fn capabilities(&self) -> DenoiserCapabilities {
        self.inner.capabilities()
    }

    fn predict(
        &self,
        x_t: Tensor<TestBackend, 4>,
        timesteps: Tensor<TestBackend, 1, Int>,
        labels: Option<Tensor<TestBackend, 1, Int>>,
    ) -> DenoiserOutput<TestBackend> {
        self.calls.set(self.calls.get() + 1);
        self.inner.predict(x_t, timesteps, labels)
    }
}

/// Leaves samples untouched and records what it was asked to do
#[derive(Default)]
struct RecordingCorrector {
    batch: usize,
    begun: Vec<(usize, usize)>,
    ended: usize,
    corrected: Vec<(usize, usize)>,
}

impl Corrector<TestBackend> for RecordingCorrector {
    fn correct(
        &mut self,
        _target: &dyn AnnealedTarget<TestBackend>,
        x: Tensor<TestBackend, 4>,
        t: usize,
        _noise: &mut NoiseSource,
    ) -> burn_guided::mcmc::Result<Tensor<TestBackend, 4>> {
        self.corrected.push((self.batch, t));
        Ok(x)
    }

    fn begin_batch(&mut self, index: usize, size: usize) {
        self.batch = index;
        self.begun.push((index, size));
    }

    fn end_batch(&mut self) {
        self.ended += 1;
    }
}

fn mixture(full: usize, respaced: usize) -> (GaussianMixtureModel<TestBackend>, DiffusionProcess) {
    let schedule = Schedule::new(BetaSchedule::Linear, full, respaced).unwrap();
    let model = GaussianMixtureConfig::default()
        .init::<TestBackend>(schedule.original_betas(), &Default::default())
        .unwrap();
    let process = DiffusionProcess::new(schedule, VarianceMode::Beta, model.capabilities()).unwrap();
    (model, process)
}

fn all_finite(tensor: &Tensor<TestBackend, 4>) -> bool {
    tensor
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap()
        .iter()
        .all(|v| v.is_finite())
}

fn predicted_labels(model: &GaussianMixtureModel<TestBackend>, x: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 1, Int> {
    let batch = x.dims()[0];
    let timesteps = Tensor::zeros([batch], &x.device());
    logits_to_label(model.logits(x, timesteps))
}

fn label_tensor(labels: &[i64]) -> Tensor<TestBackend, 1, Int> {
    Tensor::from_data(TensorData::new(labels.to_vec(), [labels.len()]), &Default::default())
}

#[test]
fn test_unguided_full_schedule_is_finite_everywhere() {
    let (model, process) = mixture(1000, 250);
    let sampler = GuidedSampler::new(process, model, NoGuidance).unwrap();
    let labels = [0i64, 1, 0, 1];
    let request = SampleRequest::new(4, &labels, [1, 4, 4])
        .with_trajectory(true)
        .with_finite_check(true);

    let mut steps = 0;
    let output = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(0), None, |_| steps += 1)
        .unwrap();

    assert_eq!(steps, 250);
    assert_eq!(output.samples.dims(), [4, 1, 4, 4]);
    let trajectory = output.trajectory.unwrap();
    assert_eq!(trajectory.len(), 251);
    assert!(trajectory.iter().all(all_finite));
}

#[test]
fn test_guidance_steers_toward_requested_class() {
    let (model, process) = mixture(1000, 250);
    let guidance = ClassifierFullGuidance::new(model.clone(), 3.0);
    let sampler = GuidedSampler::new(process, model.clone(), guidance).unwrap();
    let labels = [1i64; 16];
    let request = SampleRequest::new(16, &labels, [1, 4, 4]).with_finite_check(true);

    let output = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(9), None, |_| {})
        .unwrap();

    let acc = accuracy(label_tensor(&labels), predicted_labels(&model, output.samples));
    assert!(acc >= 0.75, "accuracy {acc}");
}

#[test]
fn test_stacked_sampling_concatenates_sub_batches() {
    let (model, process) = mixture(100, 20);
    let sampler = GuidedSampler::new(process, model, NoGuidance).unwrap();
    let labels = [0i64, 1, 0, 1, 1];
    let request = SampleRequest::new(5, &labels, [1, 2, 2]).with_trajectory(true);

    let mut batches = Vec::new();
    let output = sampler
        .sample_stacking(&request, 2, &Default::default(), &mut NoiseSource::seeded(2), None, |info| {
            if info.step == 0 {
                batches.push((info.batch_index, info.num_batches));
            }
        })
        .unwrap();

    assert_eq!(batches, vec![(0, 3), (1, 3), (2, 3)]);
    assert_eq!(output.samples.dims(), [5, 1, 2, 2]);
    let trajectory = output.trajectory.unwrap();
    assert_eq!(trajectory.len(), 21);
    assert_eq!(trajectory[20].dims(), [5, 1, 2, 2]);
}

#[test]
fn test_single_sub_batch_matches_unstacked_run() {
    let (model, process) = mixture(100, 20);
    let sampler = GuidedSampler::new(process, model, NoGuidance).unwrap();
    let labels = [0i64, 1, 1];
    let request = SampleRequest::new(3, &labels, [1, 2, 2]);

    let single = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(5), None, |_| {})
        .unwrap();
    let stacked = sampler
        .sample_stacking(&request, 3, &Default::default(), &mut NoiseSource::seeded(5), None, |_| {})
        .unwrap();

    let a: Vec<f32> = single.samples.into_data().to_vec().unwrap();
    let b: Vec<f32> = stacked.samples.into_data().to_vec().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_fixed_step_correction_runs_on_every_corrected_level() {
    let (model, process) = mixture(100, 20);
    let table: StepSizeTable = (0..19).map(|t| (t, StepSize::Scalar(1e-3))).collect();
    let guidance = ClassifierFullGuidance::new(model.clone(), 1.0);
    let sampler = GuidedSampler::new(process, model, guidance).unwrap();
    let labels = [0i64, 1];
    let request = SampleRequest::new(2, &labels, [1, 2, 2]).with_finite_check(true);

    let hmc = AnnealedHmcSampler::for_schedule(sampler.process().betas()).unwrap();
    let mut corrector = FixedStepCorrector::<TestBackend>::new(Box::new(hmc), table.clone(), 2);
    let output = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(1), Some(&mut corrector), |_| {})
        .unwrap();
    assert!(all_finite(&output.samples));

    let mut corrector =
        FixedStepCorrector::<TestBackend>::new(Box::new(AnnealedLangevinSampler::default()), table, 1);
    let output = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(1), Some(&mut corrector), |_| {})
        .unwrap();
    assert!(all_finite(&output.samples));
}

#[test]
fn test_missing_step_size_fails_before_any_denoiser_call() {
    let (model, process) = mixture(100, 10);
    let sampler = GuidedSampler::new(process, CountingDenoiser::new(model), NoGuidance).unwrap();
    let labels = [0i64];
    let request = SampleRequest::new(1, &labels, [1, 2, 2]);
    // level 8 is the first corrected level and has no entry
    let table: StepSizeTable = (0..8).map(|t| (t, StepSize::Scalar(1e-3))).collect();
    let mut corrector =
        FixedStepCorrector::<TestBackend>::new(Box::new(AnnealedLangevinSampler::default()), table, 1);

    let err = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(1), Some(&mut corrector), |_| {})
        .unwrap_err();
    assert!(matches!(
        err,
        burn_guided::Error::Mcmc(burn_guided::mcmc::Error::MissingStepSize { t: 8 })
    ));
    assert_eq!(sampler.denoiser().calls.get(), 0);
}

#[test]
fn test_corrector_follows_every_stacked_sub_batch() {
    let (model, process) = mixture(100, 10);
    let sampler = GuidedSampler::new(process, model, NoGuidance)
        .unwrap()
        .with_mcmc_lower_t(Some(5));
    let labels = [0i64, 1, 0, 1, 0];
    let request = SampleRequest::new(5, &labels, [1, 2, 2]);
    let mut corrector = RecordingCorrector::default();

    let output = sampler
        .sample_stacking(&request, 2, &Default::default(), &mut NoiseSource::seeded(6), Some(&mut corrector), |_| {})
        .unwrap();
    assert_eq!(output.samples.dims(), [5, 1, 2, 2]);
    assert_eq!(corrector.begun, vec![(0, 2), (1, 2), (2, 1)]);
    assert_eq!(corrector.ended, 3);
    let expected: Vec<(usize, usize)> = (0..3)
        .flat_map(|batch| [8, 7, 6].map(|t| (batch, t)))
        .collect();
    assert_eq!(corrector.corrected, expected);
}

#[test]
fn test_full_guidance_runs_denoiser_once_per_step() {
    let (model, process) = mixture(100, 10);
    let guidance = ClassifierFullGuidance::new(model.clone(), 1.0);
    let sampler = GuidedSampler::new(process, CountingDenoiser::new(model), guidance).unwrap();
    let labels = [0i64, 1, 1];
    let request = SampleRequest::new(3, &labels, [1, 2, 2])
        .with_batching(BatchingStrategy::Stacked { sub_batch: 2 });

    sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(2), None, |_| {})
        .unwrap();
    // two sub-batches of ten steps
    assert_eq!(sampler.denoiser().calls.get(), 20);
}

#[test]
fn test_guidance_trait_objects_share_the_sampler() {
    let (model, process) = mixture(100, 10);
    let guidance: Box<dyn Guidance<TestBackend>> = Box::new(ClassifierFullGuidance::new(model.clone(), 1.0));
    let sampler = GuidedSampler::new(process, model, guidance).unwrap();
    let labels = [1i64, 0];
    let request = SampleRequest::new(2, &labels, [1, 2, 2]);
    let output = sampler
        .sample(&request, &Default::default(), &mut NoiseSource::seeded(3), None, |_| {})
        .unwrap();
    assert!(all_finite(&output.samples));
    assert_eq!(BatchingStrategy::default(), BatchingStrategy::Single);
}
