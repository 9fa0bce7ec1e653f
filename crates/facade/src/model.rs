//! Model assembly and the forward pass.
//!
//! [`ModelBuilder`] turns a configuration and an [`Architecture`] into a
//! [`Model`]: a checked [`BuildPlan`] plus the parameters it needs. The model
//! executes the plan on every call; noise randomness is threaded explicitly
//! through [`NoiseState`].

use rand::Rng;
use tracing::{debug, info};

use pixeldp_core::{
    conv2d, conv_output_shape, dense, duplicate, enforce_bound, expect_rank, init_conv_filter,
    init_dense, leaky_relu, softmax, softmax_cross_entropy, weight_decay, ControlScheme,
    EnforcementReport, Hps, LayerKind, Mode, NoiseCalibration, NoiseLayer, PixelDpError, Result,
    SensitivityChain, SensitivityTracker, Tensor,
};
use pixeldp_prng::NoiseKey;

use crate::context::{param_name, BuildContext, ParamStore, BIASES, WEIGHTS};
use crate::plan::{Architecture, BuildPlan, BuildStep};

/// Root noise key and step counter.
///
/// Each forward pass derives its per-draw keys from `(key, step)` and returns
/// the state for the next call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoiseState {
    key: NoiseKey,
    step: u64,
}

impl NoiseState {
    /// Fresh state at step 0.
    pub fn new(key: NoiseKey) -> Self {
        Self { key, step: 0 }
    }

    /// State at an explicit step.
    pub fn at_step(key: NoiseKey, step: u64) -> Self {
        Self { key, step }
    }

    /// Root key.
    pub fn key(&self) -> NoiseKey {
        self.key
    }

    /// Current step.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// One key per noise draw at the current step.
    pub fn draw_keys(&self, n_draws: usize) -> Vec<NoiseKey> {
        self.key.draw_keys(self.step, n_draws)
    }

    /// State for the following forward pass.
    pub fn advance(self) -> Self {
        Self {
            key: self.key,
            step: self.step.wrapping_add(1),
        }
    }
}

/// Result of a forward pass with labels.
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// Logits, `[B * n_draws, num_classes]`.
    pub logits: Tensor,
    /// Softmax of the logits, `[B * n_draws, num_classes]`.
    pub predictions: Tensor,
    /// Labels tiled to match the predictions.
    pub labels: Tensor,
    /// Mean cross-entropy plus weight decay (training mode only).
    pub cost: f64,
    /// Mean cross-entropy alone.
    pub xent: f64,
    /// Weight-decay term (zero in eval mode).
    pub decay: f64,
    /// Noise calibration used in this pass.
    pub calibration: NoiseCalibration,
    /// Rescaling applied to pre-noise layers under the bound scheme.
    pub enforcement: Vec<(String, EnforcementReport)>,
    /// Noise state for the next pass.
    pub state: NoiseState,
}

impl ForwardOutput {
    /// Sensitivity of the layers preceding the noise layer.
    pub fn sensitivity(&self) -> f64 {
        self.calibration.sensitivity
    }
}

/// Result of a forward pass without labels.
#[derive(Clone, Debug)]
pub struct Prediction {
    /// Logits, `[B * n_draws, num_classes]`.
    pub logits: Tensor,
    /// Softmax of the logits, `[B * n_draws, num_classes]`.
    pub predictions: Tensor,
    /// Noise calibration used in this pass.
    pub calibration: NoiseCalibration,
    /// Noise state for the next pass.
    pub state: NoiseState,
}

/// Builds models from a configuration.
#[derive(Clone, Debug)]
pub struct ModelBuilder {
    hps: Hps,
}

impl ModelBuilder {
    /// Builder for `hps`.
    pub fn new(hps: Hps) -> Self {
        Self { hps }
    }

    /// Build `arch` for `[H, W, C]` inputs, initializing weights from `init_key`.
    pub fn build<A: Architecture + ?Sized>(
        &self,
        arch: &A,
        input_shape: [usize; 3],
        init_key: NoiseKey,
    ) -> Result<Model> {
        let mut rng = init_key.to_rng();
        self.build_with_rng(arch, input_shape, &mut rng)
    }

    /// Build `arch`, drawing initial weights from `rng`.
    ///
    /// Nothing is returned unless the whole plan checks out: configuration,
    /// layer shapes and the final logits width.
    pub fn build_with_rng<A: Architecture + ?Sized, R: Rng>(
        &self,
        arch: &A,
        input_shape: [usize; 3],
        rng: &mut R,
    ) -> Result<Model> {
        self.hps.validate()?;
        if input_shape.iter().any(|&d| d == 0) {
            return Err(PixelDpError::shape(format!(
                "input shape {input_shape:?} has an empty axis"
            )));
        }
        let plan = BuildPlan::new(arch, &self.hps)?;

        let mut ctx = BuildContext::new();
        let [h, w, c] = input_shape;
        let mut shape = vec![1, h, w, c];
        for step in plan.steps() {
            match step {
                BuildStep::Conv {
                    scope,
                    filter_size,
                    out_filters,
                    stride,
                    ..
                } => {
                    if *filter_size == 0 || *out_filters == 0 || *stride == 0 {
                        return Err(PixelDpError::config(format!(
                            "conv {scope} needs positive filter size, filters and stride"
                        )));
                    }
                    if shape.len() != 4 {
                        return Err(PixelDpError::shape(format!(
                            "conv {scope} expects a [N, H, W, C] input, got {shape:?}"
                        )));
                    }
                    let filter = init_conv_filter(*filter_size, shape[3], *out_filters, rng)?;
                    ctx.with_scope(scope, |ctx| ctx.create_param(WEIGHTS, filter))?;
                    shape = conv_output_shape(&shape, *filter_size, *out_filters, *stride)?;
                }
                BuildStep::Dense { scope, units, .. }
                | BuildStep::Logits {
                    scope,
                    num_classes: units,
                } => {
                    let in_dim = shape[1..].iter().product();
                    let (weights, biases) = init_dense(in_dim, *units, rng)?;
                    ctx.with_scope(scope, |ctx| {
                        ctx.create_param(WEIGHTS, weights)?;
                        ctx.create_param(BIASES, biases)
                    })?;
                    shape = vec![1, *units];
                }
                _ => {}
            }
        }
        if shape != [1, self.hps.num_classes] {
            return Err(PixelDpError::shape(format!(
                "{} produces outputs of shape {:?}, expected [N, {}]",
                arch.name(),
                &shape[1..],
                self.hps.num_classes
            )));
        }

        let params = ctx.into_params();
        info!(
            arch = arch.name(),
            tensors = params.len(),
            scalars = params.num_scalars(),
            noise_position = plan.noise_position(),
            n_draws = self.hps.n_draws,
            norm = %self.hps.sensitivity_norm,
            scheme = %self.hps.sensitivity_control_scheme,
            "built model"
        );
        for line in plan.describe() {
            debug!(step = %line, "plan");
        }

        Ok(Model {
            hps: self.hps.clone(),
            plan,
            params,
            input_shape,
        })
    }
}

/// Build `arch` under `hps`; shorthand for [`ModelBuilder::build`].
pub fn build_model<A: Architecture + ?Sized>(
    hps: Hps,
    arch: &A,
    input_shape: [usize; 3],
    init_key: NoiseKey,
) -> Result<Model> {
    ModelBuilder::new(hps).build(arch, input_shape, init_key)
}

/// A built network: configuration, plan and parameters.
#[derive(Clone, Debug)]
pub struct Model {
    hps: Hps,
    plan: BuildPlan,
    params: ParamStore,
    input_shape: [usize; 3],
}

/// Everything a pass over the plan produced.
struct Trace {
    logits: Tensor,
    predictions: Tensor,
    loss: Option<(Tensor, f64, f64)>,
    calibration: NoiseCalibration,
    enforcement: Vec<(String, EnforcementReport)>,
}

impl Model {
    /// Configuration the model was built with.
    pub fn hps(&self) -> &Hps {
        &self.hps
    }

    /// Steps executed by every forward pass.
    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    /// Model parameters.
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Model parameters, for the optimizer.
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Per-example input shape `[H, W, C]`.
    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    /// Forward pass with loss.
    ///
    /// `images` is `[B, H, W, C]`, `labels` is one-hot `[B, num_classes]`.
    /// Predictions cover `B * n_draws` rows; rows `k * B..(k + 1) * B` are
    /// noise draw `k`. The noise is a function of `state`: passing the same
    /// state again replays the same noise, so thread the returned `state`
    /// into the next call to get fresh draws.
    pub fn forward(
        &self,
        images: &Tensor,
        labels: &Tensor,
        mode: Mode,
        state: NoiseState,
    ) -> Result<ForwardOutput> {
        let batch = self.check_images(images)?;
        let expected = [batch, self.hps.num_classes];
        if labels.shape() != expected {
            return Err(PixelDpError::shape(format!(
                "labels must have shape {expected:?}, got {:?}",
                labels.shape()
            )));
        }

        let trace = self.run(images, Some(labels), mode, &state)?;
        let Some((labels, xent, decay)) = trace.loss else {
            return Err(PixelDpError::config("plan has no loss step"));
        };
        let cost = xent + decay;
        if !cost.is_finite() {
            return Err(PixelDpError::numerical(format!("cost is not finite: {cost}")));
        }
        debug!(step = state.step(), ?mode, cost, xent, decay, "forward pass");

        Ok(ForwardOutput {
            logits: trace.logits,
            predictions: trace.predictions,
            labels,
            cost,
            xent,
            decay,
            calibration: trace.calibration,
            enforcement: trace.enforcement,
            state: state.advance(),
        })
    }

    /// Forward pass without labels, for certification.
    pub fn predict(&self, images: &Tensor, state: NoiseState) -> Result<Prediction> {
        self.check_images(images)?;
        let trace = self.run(images, None, Mode::Eval, &state)?;
        Ok(Prediction {
            logits: trace.logits,
            predictions: trace.predictions,
            calibration: trace.calibration,
            state: state.advance(),
        })
    }

    /// Project stored pre-noise weights onto their sensitivity bounds.
    ///
    /// Under the bound scheme the forward pass rescales weights on the fly;
    /// calling this after an optimizer update makes the stored weights
    /// themselves satisfy the bounds. Does nothing under the optimize scheme.
    pub fn enforce_bounds(&mut self) -> Result<Vec<(String, EnforcementReport)>> {
        if self.hps.sensitivity_control_scheme != ControlScheme::Bound {
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for step in self.plan.steps() {
            let (scope, kind, layer) = match step {
                BuildStep::Conv {
                    scope,
                    stride,
                    pre_noise: Some(layer),
                    ..
                } => (scope, LayerKind::Conv { stride: *stride }, *layer),
                BuildStep::Dense {
                    scope,
                    pre_noise: Some(layer),
                    ..
                } => (scope, LayerKind::Dense, *layer),
                _ => continue,
            };
            let name = param_name(scope, WEIGHTS);
            let target = self.hps.layer_bound(layer)?;
            let (projected, report) = enforce_bound(
                self.params.get(&name)?,
                kind,
                self.hps.sensitivity_norm,
                target,
            )?;
            self.params.set(&name, projected)?;
            reports.push((scope.clone(), report));
        }
        Ok(reports)
    }

    fn check_images(&self, images: &Tensor) -> Result<usize> {
        expect_rank(images, 4, "images")?;
        let batch = images.shape()[0];
        if batch == 0 {
            return Err(PixelDpError::shape("image batch is empty"));
        }
        if images.shape()[1..] != self.input_shape {
            return Err(PixelDpError::shape(format!(
                "model expects images of shape [N, {}, {}, {}], got {:?}",
                self.input_shape[0],
                self.input_shape[1],
                self.input_shape[2],
                images.shape()
            )));
        }
        Ok(batch)
    }

    fn run(
        &self,
        images: &Tensor,
        labels: Option<&Tensor>,
        mode: Mode,
        state: &NoiseState,
    ) -> Result<Trace> {
        let hps = &self.hps;
        let tracker = SensitivityTracker::new(hps.sensitivity_norm, hps.sensitivity_control_scheme);
        let mut chain = SensitivityChain::new();
        let mut calibration = None;
        let mut enforcement = Vec::new();

        let mut x = images.clone();
        let mut logits = None;
        let mut predictions = None;
        let mut tiled_labels = None;
        let mut loss = None;

        for step in self.plan.steps() {
            match step {
                BuildStep::DuplicateInputs { n_draws } => x = duplicate(&x, *n_draws)?,
                BuildStep::InjectNoise { position } => {
                    let cal = NoiseCalibration::new(chain.sensitivity(), hps)?;
                    debug!(
                        position,
                        sensitivity = cal.sensitivity,
                        scale = cal.scale,
                        "calibrated noise"
                    );
                    x = NoiseLayer::new(*position).apply(&x, &cal, &state.draw_keys(hps.n_draws))?;
                    calibration = Some(cal);
                }
                BuildStep::Conv {
                    scope,
                    stride,
                    pre_noise,
                    ..
                } => {
                    let filter = self.params.get(&param_name(scope, WEIGHTS))?;
                    x = match pre_noise {
                        Some(layer) => {
                            let tracked = tracker.track(
                                scope,
                                filter,
                                LayerKind::Conv { stride: *stride },
                                hps.layer_bound(*layer)?,
                            )?;
                            chain.push(tracked.sensitivity)?;
                            if let Some(report) = tracked.enforcement {
                                enforcement.push((scope.clone(), report));
                            }
                            conv2d(&x, &tracked.weights, *stride)?
                        }
                        None => conv2d(&x, filter, *stride)?,
                    };
                }
                BuildStep::Activate { leakiness } => {
                    if calibration.is_none() {
                        chain.push_activation(*leakiness)?;
                    }
                    x = leaky_relu(&x, *leakiness);
                }
                BuildStep::Dense {
                    scope,
                    pre_noise: Some(layer),
                    ..
                } => {
                    let weights = self.params.get(&param_name(scope, WEIGHTS))?;
                    let biases = self.params.get(&param_name(scope, BIASES))?;
                    let tracked =
                        tracker.track(scope, weights, LayerKind::Dense, hps.layer_bound(*layer)?)?;
                    chain.push(tracked.sensitivity)?;
                    if let Some(report) = tracked.enforcement {
                        enforcement.push((scope.clone(), report));
                    }
                    x = dense(&x, &tracked.weights, biases)?;
                }
                BuildStep::Dense { scope, .. } | BuildStep::Logits { scope, .. } => {
                    let weights = self.params.get(&param_name(scope, WEIGHTS))?;
                    let biases = self.params.get(&param_name(scope, BIASES))?;
                    x = dense(&x, weights, biases)?;
                    if matches!(step, BuildStep::Logits { .. }) {
                        logits = Some(x.clone());
                    }
                }
                BuildStep::Softmax => predictions = Some(softmax(&x)?),
                BuildStep::DuplicateLabels { n_draws } => {
                    if let Some(labels) = labels {
                        tiled_labels = Some(duplicate(labels, *n_draws)?);
                    }
                }
                BuildStep::Loss { weight_decay_rate } => {
                    let (Some(labels), Some(logits)) = (tiled_labels.take(), logits.as_ref()) else {
                        continue;
                    };
                    let xent = softmax_cross_entropy(logits, &labels)?
                        .mean()
                        .ok_or_else(|| PixelDpError::shape("cannot average an empty batch"))?;
                    let decay = match mode {
                        Mode::Train => weight_decay(self.params.decayed(), *weight_decay_rate),
                        Mode::Eval => 0.0,
                    };
                    loss = Some((labels, xent, decay));
                }
            }
        }

        let (Some(logits), Some(predictions), Some(calibration)) = (logits, predictions, calibration)
        else {
            return Err(PixelDpError::config(
                "plan must produce logits, predictions and a noise layer",
            ));
        };

        Ok(Trace {
            logits,
            predictions,
            loss,
            calibration,
            enforcement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnn::Cnn;
    use ndarray::{Array, IxDyn};
    use pixeldp_core::SensitivityNorm;

    fn small_cnn() -> Cnn {
        Cnn::default().with_dense_units(16)
    }

    fn images(batch: usize) -> Tensor {
        Array::from_shape_fn(IxDyn(&[batch, 8, 8, 3]), |ix| {
            ((ix[0] * 7 + ix[1] * 3 + ix[2] + ix[3]) % 11) as f64 as _
        })
    }

    fn one_hot(batch: usize, classes: usize) -> Tensor {
        Array::from_shape_fn(IxDyn(&[batch, classes]), |ix| {
            if ix[1] == ix[0] % classes {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn builder_creates_scoped_parameters() {
        let model = ModelBuilder::new(Hps::default())
            .build(&small_cnn(), [8, 8, 3], NoiseKey::new(0))
            .unwrap();
        let names: Vec<&str> = model.params().names().collect();
        assert_eq!(
            names,
            vec![
                "conv2/DW",
                "dense/DW",
                "dense/biases",
                "init/init_conv/DW",
                "logit/DW",
                "logit/biases",
            ]
        );
        assert_eq!(model.params().get("init/init_conv/DW").unwrap().shape(), &[5, 5, 3, 32]);
        assert_eq!(model.params().get("dense/DW").unwrap().shape(), &[2 * 2 * 64, 16]);
    }

    #[test]
    fn forward_shapes_and_state() {
        let hps = Hps::default().with_n_draws(3).with_num_classes(4);
        let model = build_model(hps, &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let state = NoiseState::new(NoiseKey::new(2));
        let out = model
            .forward(&images(2), &one_hot(2, 4), Mode::Train, state)
            .unwrap();
        assert_eq!(out.predictions.shape(), &[6, 4]);
        assert_eq!(out.labels.shape(), &[6, 4]);
        assert_eq!(out.state.step(), 1);
        assert!(out.cost.is_finite() && out.cost >= 0.0);
        assert!(out.decay > 0.0);
        for row in out.predictions.outer_iter() {
            assert!((row.sum() as f64 - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn eval_mode_has_no_decay() {
        let model = build_model(Hps::default(), &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let state = NoiseState::new(NoiseKey::new(2));
        let train = model
            .forward(&images(2), &one_hot(2, 10), Mode::Train, state)
            .unwrap();
        let eval = model
            .forward(&images(2), &one_hot(2, 10), Mode::Eval, state)
            .unwrap();
        assert_eq!(eval.decay, 0.0);
        assert!((train.xent - eval.xent).abs() < 1e-9);
        assert!(train.cost > eval.cost);
    }

    #[test]
    fn image_noise_has_unit_sensitivity() {
        let hps = Hps::default().with_noise_after_n_layers(0);
        let model = build_model(hps, &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let out = model
            .predict(&images(1), NoiseState::new(NoiseKey::new(3)))
            .unwrap();
        assert_eq!(out.calibration.sensitivity, 1.0);
    }

    #[test]
    fn bound_scheme_reports_product_of_targets() {
        let hps = Hps::default()
            .with_noise_after_n_layers(2)
            .with_layer_sensitivity_bounds(vec![0.5, 2.0]);
        let model = build_model(hps, &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let out = model
            .forward(&images(1), &one_hot(1, 10), Mode::Eval, NoiseState::new(NoiseKey::new(3)))
            .unwrap();
        assert!((out.sensitivity() - 1.0).abs() < 1e-12);
        assert_eq!(out.enforcement.len(), 2);
    }

    #[test]
    fn optimize_scheme_reports_measured_bound() {
        let hps = Hps::default()
            .with_control_scheme(ControlScheme::Optimize)
            .with_sensitivity_norm(SensitivityNorm::L1);
        let model = build_model(hps, &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let out = model
            .forward(&images(1), &one_hot(1, 10), Mode::Eval, NoiseState::new(NoiseKey::new(3)))
            .unwrap();
        let measured = pixeldp_core::operator_norm_bound(
            model.params().get("init/init_conv/DW").unwrap(),
            LayerKind::Conv { stride: 2 },
            SensitivityNorm::L1,
        )
        .unwrap();
        assert!((out.sensitivity() - measured).abs() < 1e-12);
        assert!(out.enforcement.is_empty());
    }

    #[test]
    fn enforce_bounds_projects_stored_weights() {
        let hps = Hps::default().with_layer_sensitivity_bounds(vec![0.01]);
        let mut model = build_model(hps, &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let reports = model.enforce_bounds().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].1.clipped);
        let bound = pixeldp_core::operator_norm_bound(
            model.params().get("init/init_conv/DW").unwrap(),
            LayerKind::Conv { stride: 2 },
            SensitivityNorm::L2,
        )
        .unwrap();
        assert!(bound <= 0.01 * (1.0 + 1e-4));
    }

    #[test]
    fn mismatched_inputs_are_shape_errors() {
        let model = build_model(Hps::default(), &small_cnn(), [8, 8, 3], NoiseKey::new(1)).unwrap();
        let state = NoiseState::new(NoiseKey::new(0));
        let wrong_hw = Tensor::zeros(IxDyn(&[1, 9, 8, 3]));
        assert!(model
            .forward(&wrong_hw, &one_hot(1, 10), Mode::Eval, state)
            .unwrap_err()
            .is_shape());
        assert!(model
            .forward(&images(2), &one_hot(3, 10), Mode::Eval, state)
            .unwrap_err()
            .is_shape());
        assert!(model
            .forward(&images(2), &one_hot(2, 5), Mode::Eval, state)
            .unwrap_err()
            .is_shape());
        assert!(model.predict(&Tensor::zeros(IxDyn(&[0, 8, 8, 3])), state).unwrap_err().is_shape());
    }

    #[test]
    fn invalid_configuration_builds_nothing() {
        let hps = Hps::default().with_noise_after_n_layers(3);
        let err = build_model(hps, &small_cnn(), [8, 8, 3], NoiseKey::new(0)).unwrap_err();
        assert!(err.is_config());
        let err = build_model(Hps::default(), &small_cnn(), [0, 8, 3], NoiseKey::new(0)).unwrap_err();
        assert!(err.is_shape());
    }
}
