//! End-to-end sampling runs against mock inference services

use std::cell::{Cell, RefCell};

use burn::prelude::*;
use burn::tensor::{Distribution, Int, TensorData};
use burn_models_ldm_samplers::{
    control_name, Conditioning, ControlInputs, ControlModel, ControlOutputs, DenoisingModel,
    Discretization, InferenceError, LdmSampler, NoControl, PredictionType, SampleCallbacks,
    SampleRequest, SamplerError, SamplerKind, SamplingConfig, ScheduleParams, ScheduleTables,
    ScoreCorrector, UnetInputs,
};
use burn_ndarray::NdArray;

type TestBackend = NdArray;

const SHAPE: [usize; 3] = [4, 8, 8];

fn device() -> <TestBackend as Backend>::Device {
    Default::default()
}

fn values<const D: usize>(tensor: &Tensor<TestBackend, D>) -> Vec<f32> {
    tensor.clone().into_data().to_vec::<f32>().unwrap()
}

fn max_abs(tensor: &Tensor<TestBackend, 4>) -> f32 {
    values(tensor).iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

/// Predicts a fixed fraction of its input as noise and records every call
#[derive(Default)]
struct RecordingUnet {
    calls: Cell<usize>,
    timesteps: RefCell<Vec<i64>>,
    input_max_abs: RefCell<Vec<f32>>,
    control_counts: RefCell<Vec<usize>>,
    prediction_type: PredictionType,
}

impl DenoisingModel<TestBackend> for RecordingUnet {
    fn infer(
        &self,
        inputs: UnetInputs<TestBackend>,
    ) -> Result<Tensor<TestBackend, 4>, InferenceError> {
        self.calls.set(self.calls.get() + 1);
        let t: Vec<i64> = inputs.timesteps.into_data().convert::<i64>().to_vec().unwrap();
        self.timesteps.borrow_mut().push(t[0]);
        self.input_max_abs.borrow_mut().push(max_abs(&inputs.x));
        self.control_counts.borrow_mut().push(inputs.controls.len());
        Ok(inputs.x * 0.1)
    }

    fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }
}

/// Emits `levels` zero-valued control signals
struct ZeroControl {
    levels: usize,
    calls: Cell<usize>,
}

impl ZeroControl {
    fn new(levels: usize) -> Self {
        Self {
            levels,
            calls: Cell::new(0),
        }
    }
}

impl ControlModel<TestBackend> for ZeroControl {
    fn infer(
        &self,
        inputs: ControlInputs<TestBackend>,
    ) -> Result<ControlOutputs<TestBackend>, InferenceError> {
        self.calls.set(self.calls.get() + 1);
        let mut outputs = ControlOutputs::new();
        for i in 0..self.levels {
            outputs.insert(control_name(i), inputs.x.zeros_like());
        }
        Ok(outputs)
    }
}

struct Identity;

impl ScoreCorrector<TestBackend> for Identity {
    fn modify_score(
        &self,
        _model: &dyn DenoisingModel<TestBackend>,
        eps: Tensor<TestBackend, 4>,
        _x: &Tensor<TestBackend, 4>,
        _timesteps: &Tensor<TestBackend, 1, Int>,
        _conditioning: &Conditioning<TestBackend>,
    ) -> Result<Tensor<TestBackend, 4>, InferenceError> {
        Ok(eps)
    }
}

fn context(value: f32) -> Conditioning<TestBackend> {
    Conditioning::new(Tensor::full([1, 2, 8], value, &device()))
}

fn hint() -> Tensor<TestBackend, 4> {
    Tensor::zeros([1, 3, 64, 64], &device())
}

fn initial_noise() -> Tensor<TestBackend, 4> {
    Tensor::random([1, 4, 8, 8], Distribution::Normal(0.0, 1.0), &device())
}

fn config(steps: usize) -> SamplingConfig {
    SamplingConfig {
        steps,
        ..Default::default()
    }
}

fn ddim_sampler(levels: usize) -> LdmSampler<TestBackend, RecordingUnet, ZeroControl> {
    LdmSampler::new(
        RecordingUnet::default(),
        ZeroControl::new(levels),
        SamplerKind::ddim(0.0),
        &device(),
    )
}

#[test]
fn test_ddim_ten_steps() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);

    let (sample, intermediates) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config(10),
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert_eq!(sample.dims(), [1, 4, 8, 8]);
    assert!(values(&sample).iter().all(|v| v.is_finite()));
    assert_eq!(sampler.model().calls.get(), 10);
    assert_eq!(
        *sampler.model().timesteps.borrow(),
        vec![1000, 889, 778, 667, 556, 445, 334, 223, 112, 1]
    );
    assert_eq!(intermediates.len(), 3);
}

#[test]
fn test_ddim_is_deterministic_without_eta() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);
    let x_t = initial_noise();

    let run = |x_t: Tensor<TestBackend, 4>| {
        sampler
            .sample(
                SampleRequest::new(&cond, 1, SHAPE).with_initial_noise(x_t),
                &config(10),
                &mut SampleCallbacks::default(),
            )
            .unwrap()
            .0
    };

    let first = values(&run(x_t.clone()));
    let second = values(&run(x_t));
    assert_eq!(first, second);
}

#[test]
fn test_guidance_doubles_model_calls() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);
    let uncond = context(0.0);

    let config = SamplingConfig {
        guidance_scale: 7.5,
        ..config(10)
    };
    sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE).with_unconditional(&uncond),
            &config,
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert_eq!(sampler.model().calls.get(), 20);
}

#[test]
fn test_plms_ten_steps_makes_eleven_calls() {
    let sampler = LdmSampler::new(
        RecordingUnet::default(),
        ZeroControl::new(0),
        SamplerKind::plms(),
        &device(),
    );
    let cond = context(1.0);

    let (sample, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config(10),
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert!(values(&sample).iter().all(|v| v.is_finite()));
    assert_eq!(sampler.model().calls.get(), 11);
    // first step looks ahead to the next timestep
    assert_eq!(sampler.model().timesteps.borrow()[..3], [1000, 889, 889]);
}

#[test]
fn test_plms_ignores_quad_discretization() {
    let sampler = LdmSampler::new(
        RecordingUnet::default(),
        ZeroControl::new(0),
        SamplerKind::plms(),
        &device(),
    );
    let cond = context(1.0);

    let config = SamplingConfig {
        discretization: Discretization::Quad,
        ..config(10)
    };
    sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config,
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert_eq!(sampler.model().timesteps.borrow()[0], 1000);
}

#[test]
fn test_plms_rejects_eta() {
    assert!(matches!(
        SamplerKind::from_parts("plms", 0.5),
        Err(SamplerError::EtaNotSupported { .. })
    ));
}

#[test]
fn test_control_signals_reach_unet() {
    let sampler = ddim_sampler(13);
    let cond = context(1.0).with_hint(hint());
    let uncond = context(0.0).with_hint(hint());

    let config = SamplingConfig {
        guidance_scale: 9.0,
        control_scales: Some(vec![1.0; 13]),
        ..config(3)
    };
    sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE).with_unconditional(&uncond),
            &config,
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert_eq!(sampler.control_model().calls.get(), 6);
    assert!(sampler
        .model()
        .control_counts
        .borrow()
        .iter()
        .all(|&n| n == 13));
}

#[test]
fn test_control_scale_mismatch_fails_before_unet() {
    let sampler = ddim_sampler(3);
    let cond = context(1.0).with_hint(hint());

    let config = SamplingConfig {
        control_scales: Some(vec![1.0, 1.0]),
        ..config(10)
    };
    let result = sampler.sample(
        SampleRequest::new(&cond, 1, SHAPE),
        &config,
        &mut SampleCallbacks::default(),
    );

    assert!(matches!(
        result,
        Err(SamplerError::ControlScaleMismatch {
            scales: 2,
            controls: 3
        })
    ));
    assert_eq!(sampler.model().calls.get(), 0);
}

#[test]
fn test_hint_without_control_model_fails() {
    let sampler = LdmSampler::new(
        RecordingUnet::default(),
        NoControl,
        SamplerKind::ddim(0.0),
        &device(),
    );
    let cond = context(1.0).with_hint(hint());

    let result = sampler.sample(
        SampleRequest::new(&cond, 1, SHAPE),
        &config(10),
        &mut SampleCallbacks::default(),
    );

    assert!(matches!(
        result,
        Err(SamplerError::Inference {
            service: "control model",
            ..
        })
    ));
    assert_eq!(sampler.model().calls.get(), 0);
}

#[test]
fn test_zero_mask_matches_unmasked_run() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);
    let x_t = initial_noise();
    let x0 = initial_noise();

    let (unmasked, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE).with_initial_noise(x_t.clone()),
            &config(10),
            &mut SampleCallbacks::default(),
        )
        .unwrap();
    let (masked, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE)
                .with_initial_noise(x_t)
                .with_mask(x0.zeros_like(), x0),
            &config(10),
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    for (a, b) in values(&unmasked).iter().zip(values(&masked)) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_full_mask_follows_noised_known_trajectory() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);
    let x_t: Tensor<TestBackend, 4> = Tensor::full([1, 4, 8, 8], 1.0e6, &device());
    let x0: Tensor<TestBackend, 4> = Tensor::zeros([1, 4, 8, 8], &device());

    let (sample, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE)
                .with_initial_noise(x_t)
                .with_mask(x0.ones_like(), x0),
            &config(10),
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    // every model input is q_sample(0, t, noise) = sqrt(1 - acp[t]) * noise
    let tables = ScheduleTables::build(&ScheduleParams {
        steps: 10,
        ..Default::default()
    })
    .unwrap();
    let timesteps = sampler.model().timesteps.borrow();
    let input_max_abs = sampler.model().input_max_abs.borrow();
    assert_eq!(input_max_abs.len(), 10);
    for (&t, &observed) in timesteps.iter().zip(input_max_abs.iter()) {
        let row = (t as usize).min(tables.num_train_timesteps() - 1);
        let scale = tables.sqrt_one_minus_alphas_cumprod[row] as f32;
        assert!(observed > 0.0, "t={}: input is not noised", t);
        assert!(observed < 6.0 * scale, "t={}: {} exceeds 6 * {}", t, observed, scale);
    }
    assert!(max_abs(&sample) < 1.0);
}

#[test]
fn test_batch_size_mismatch_is_not_fatal() {
    let sampler = ddim_sampler(0);
    let cond = Conditioning::new(Tensor::full([2, 2, 8], 1.0, &device()));

    let (sample, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config(10),
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert_eq!(sample.dims(), [1, 4, 8, 8]);
    assert_eq!(sampler.model().calls.get(), 10);
}

/// Scalar PLMS over one element, pushing the raw eps into the history
fn reference_plms(mut x: f64, tables: &ScheduleTables, eps_of: impl Fn(f64) -> f64) -> f64 {
    let reconstruct = |x: f64, eps: f64, index: usize| {
        let a_t = tables.ddim_alphas[index];
        let a_prev = tables.ddim_alphas_prev[index];
        let sigma = tables.ddim_sigmas[index];
        let pred_x0 = (x - tables.ddim_sqrt_one_minus_alphas[index] * eps) / a_t.sqrt();
        a_prev.sqrt() * pred_x0 + (1.0 - a_prev - sigma * sigma).sqrt() * eps
    };

    let mut history: Vec<f64> = Vec::new();
    for step in tables.plan().traversal() {
        let eps = eps_of(x);
        let n = history.len();
        let eps_prime = match n {
            0 => (eps + eps_of(reconstruct(x, eps, step.index))) / 2.0,
            1 => (3.0 * eps - history[n - 1]) / 2.0,
            2 => (23.0 * eps - 16.0 * history[n - 1] + 5.0 * history[n - 2]) / 12.0,
            _ => {
                (55.0 * eps - 59.0 * history[n - 1] + 37.0 * history[n - 2]
                    - 9.0 * history[n - 3])
                    / 24.0
            }
        };
        x = reconstruct(x, eps_prime, step.index);
        history.push(eps);
        if history.len() > 3 {
            history.remove(0);
        }
    }
    x
}

/// Affine noise prediction independent of the timestep
struct AffineUnet;

impl DenoisingModel<TestBackend> for AffineUnet {
    fn infer(
        &self,
        inputs: UnetInputs<TestBackend>,
    ) -> Result<Tensor<TestBackend, 4>, InferenceError> {
        Ok(inputs.x * 0.1 + 0.05)
    }
}

#[test]
fn test_plms_matches_scalar_multistep_reference() {
    let sampler = LdmSampler::new(AffineUnet, NoControl, SamplerKind::plms(), &device());
    let cond = context(1.0);

    let initial: Vec<f32> = (0..16).map(|i| (i as f32 - 7.5) * 0.3).collect();
    let x_t = Tensor::<TestBackend, 4>::from_data(
        TensorData::new(initial.clone(), [1, 4, 2, 2]),
        &device(),
    );

    let (sample, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, [4, 2, 2]).with_initial_noise(x_t),
            &config(6),
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    let tables = sampler.make_schedule(6, Discretization::Uniform).unwrap();
    let eps_of = |x: f64| 0.1 * x + 0.05;
    for (i, (&x, actual)) in initial.iter().zip(values(&sample)).enumerate() {
        let expected = reference_plms(x as f64, &tables, eps_of) as f32;
        let tolerance = 1e-3 * expected.abs().max(1.0);
        assert!(
            (expected - actual).abs() < tolerance,
            "element {}: expected {}, got {}",
            i,
            expected,
            actual
        );
    }
}

#[test]
fn test_mask_without_known_sample_fails() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);

    let mut request = SampleRequest::new(&cond, 1, SHAPE);
    request.mask = Some(Tensor::ones([1, 4, 8, 8], &device()));

    let result = sampler.sample(request, &config(10), &mut SampleCallbacks::default());
    assert!(matches!(result, Err(SamplerError::MissingKnownSample)));
    assert_eq!(sampler.model().calls.get(), 0);
}

#[test]
fn test_invalid_step_count_fails_before_inference() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);

    for steps in [0, 1001] {
        let result = sampler.sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config(steps),
            &mut SampleCallbacks::default(),
        );
        assert!(matches!(
            result,
            Err(SamplerError::InvalidStepCount { max: 1000, .. })
        ));
    }
    assert_eq!(sampler.model().calls.get(), 0);
}

#[test]
fn test_score_corrector_requires_epsilon_model() {
    let sampler = LdmSampler::new(
        RecordingUnet {
            prediction_type: PredictionType::VPrediction,
            ..Default::default()
        },
        ZeroControl::new(0),
        SamplerKind::ddim(0.0),
        &device(),
    );
    let cond = context(1.0);

    let result = sampler.sample(
        SampleRequest::new(&cond, 1, SHAPE).with_score_corrector(&Identity),
        &config(10),
        &mut SampleCallbacks::default(),
    );
    assert!(matches!(
        result,
        Err(SamplerError::ScoreCorrectorParameterization(
            PredictionType::VPrediction
        ))
    ));
    assert_eq!(sampler.model().calls.get(), 0);
}

#[test]
fn test_callbacks_and_intermediates() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);

    let progress_steps = RefCell::new(Vec::<usize>::new());
    let image_calls = Cell::new(0);
    let mut callbacks = SampleCallbacks {
        progress: Some(Box::new(|step: usize| progress_steps.borrow_mut().push(step))),
        image: Some(Box::new(|pred_x0: &Tensor<TestBackend, 4>, _step: usize| {
            assert_eq!(pred_x0.dims(), [1, 4, 8, 8]);
            image_calls.set(image_calls.get() + 1);
        })),
    };

    let config = SamplingConfig {
        log_every_t: 2,
        ..config(10)
    };
    let (_, intermediates) = sampler
        .sample(SampleRequest::new(&cond, 1, SHAPE), &config, &mut callbacks)
        .unwrap();
    drop(callbacks);

    assert_eq!(*progress_steps.borrow(), (0..10).collect::<Vec<_>>());
    assert_eq!(image_calls.get(), 10);
    // initial sample, index 9 (last of the plan), then indices 8, 6, 4, 2, 0
    assert_eq!(intermediates.x_inter.len(), 7);
    assert_eq!(intermediates.pred_x0.len(), 7);
}

#[test]
fn test_sub_range_runs_prefix_of_plan() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);

    let config = SamplingConfig {
        timesteps: Some(5),
        ..config(10)
    };
    sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config,
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert_eq!(*sampler.model().timesteps.borrow(), vec![334, 223, 112, 1]);
}

#[test]
fn test_original_steps_walk_training_timesteps() {
    let sampler = ddim_sampler(0);
    let cond = context(1.0);

    let config = SamplingConfig {
        use_original_steps: true,
        timesteps: Some(20),
        ..config(10)
    };
    let (sample, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config,
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert!(values(&sample).iter().all(|v| v.is_finite()));
    let timesteps = sampler.model().timesteps.borrow();
    assert_eq!(timesteps.len(), 20);
    assert_eq!(timesteps[0], 19);
    assert_eq!(timesteps[19], 0);
}

#[test]
fn test_stochastic_ddim_stays_finite() {
    let sampler = LdmSampler::new(
        RecordingUnet::default(),
        ZeroControl::new(0),
        SamplerKind::ddim(1.0),
        &device(),
    );
    let cond = context(1.0);

    let config = SamplingConfig {
        noise: burn_models_ldm_samplers::NoiseParams {
            temperature: 0.7,
            noise_dropout: 0.2,
        },
        ..config(10)
    };
    let (sample, _) = sampler
        .sample(
            SampleRequest::new(&cond, 1, SHAPE),
            &config,
            &mut SampleCallbacks::default(),
        )
        .unwrap();

    assert!(values(&sample).iter().all(|v| v.is_finite()));
}
