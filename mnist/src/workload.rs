use std::{cell::RefCell, collections::BTreeMap, rc::Rc, sync::Arc};

use log::{debug, info};
use machine_learning::arch::{ParamKind, ParamSlot, Sequential, Tape};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewD, IxDyn, Zip};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    Result, WorkloadErr,
    batch::{Batch, BatchShape, RawBatch},
    data::{IMAGE_PIXELS, InMemoryDataset, InputPipeline, PipelineOptions, TRAIN_MEAN, TRAIN_STDDEV},
    distributor::{BatchDistributor, Distribution},
    loss::{self, LossOutput},
    metrics::EvalMetrics,
    model::{self, OUTPUT_LAYER, PARAM_PREFIX},
};

/// Whether a forward pass records what `backward` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPassMode {
    Train,
    Eval,
}

/// The model keeps no state besides its parameters, so there is no value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxState {}

/// The dataset split an input queue walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    /// The train examples, walked once in order for evaluation.
    EvalTrain,
    Validation,
    Test,
}

/// The flat parameter buffer of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Params(Vec<f32>);

impl Params {
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The result of a forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Unnormalized class scores, `[B, 10]`.
    pub scores: Array2<f32>,
    /// Recorded in `ForwardPassMode::Train` only.
    pub tape: Option<Tape>,
}

impl ForwardOutput {
    /// Returns the recorded tape.
    ///
    /// # Errors
    /// `WorkloadErr::MissingTape` if the pass ran in `ForwardPassMode::Eval`.
    pub fn tape(&self) -> Result<&Tape> {
        self.tape.as_ref().ok_or(WorkloadErr::MissingTape)
    }
}

/// The MNIST workload: a two layer perceptron over 28x28 grayscale digits.
#[derive(Debug, Clone)]
pub struct MnistWorkload {
    net: Sequential,
    slots: Vec<ParamSlot>,
}

impl Default for MnistWorkload {
    fn default() -> Self {
        Self::new()
    }
}

impl MnistWorkload {
    pub const TARGET_METRIC: &'static str = "accuracy";
    pub const VALIDATION_TARGET: f32 = 0.97;
    pub const TEST_TARGET: f32 = 0.97;
    pub const NUM_TRAIN_EXAMPLES: usize = 50_000;
    pub const NUM_VALIDATION_EXAMPLES: usize = 10_000;
    pub const NUM_TEST_EXAMPLES: usize = 10_000;
    pub const EVAL_BATCH_SIZE: usize = 10_000;
    pub const TRAIN_MEAN: f32 = TRAIN_MEAN;
    pub const TRAIN_STDDEV: f32 = TRAIN_STDDEV;
    pub const MAX_ALLOWED_RUNTIME_SEC: u64 = 60;
    pub const EVAL_PERIOD_TIME_SEC: u64 = 10;
    /// The amount of steps a reasonable training run takes.
    pub const STEP_HINT: usize = 7_813;

    pub fn new() -> Self {
        let net = model::mnist_net();
        let slots = net.param_slots(PARAM_PREFIX);
        Self { net, slots }
    }

    /// Samples a fresh set of parameters: LeCun truncated normal weights and zero biases.
    ///
    /// # Arguments
    /// * `seed` - Makes the initialization reproducible.
    /// * `dropout_rate` - Ignored, the model has no dropout.
    /// * `aux_dropout_rate` - Ignored.
    ///
    /// # Returns
    /// The parameters and no auxiliary state.
    pub fn init_model_fn(
        &self,
        seed: u64,
        _dropout_rate: Option<f32>,
        _aux_dropout_rate: Option<f32>,
    ) -> Result<(Params, Option<AuxState>)> {
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(seed)));
        let params = self.net.init_params(rng)?;

        info!(seed = seed, params = params.len(); "model initialized");
        Ok((Params(params), None))
    }

    /// Whether `key` names a parameter of the output layer.
    pub fn is_output_params(&self, key: &str) -> bool {
        key.strip_prefix(PARAM_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_prefix(OUTPUT_LAYER))
            .is_some_and(|rest| rest == ".weight" || rest == ".bias")
    }

    /// Returns the shape of every parameter tensor, by key.
    pub fn param_shapes(&self) -> BTreeMap<&str, &[usize]> {
        self.slots
            .iter()
            .map(|slot| (slot.key.as_str(), slot.shape.as_slice()))
            .collect()
    }

    /// Returns whether every parameter tensor is a weight or a bias, by key.
    pub fn param_types(&self) -> BTreeMap<&str, ParamKind> {
        self.slots
            .iter()
            .map(|slot| (slot.key.as_str(), slot.kind))
            .collect()
    }

    /// Returns a view of the parameter tensor named `key`.
    pub fn param<'a>(&self, params: &'a Params, key: &str) -> Option<ArrayViewD<'a, f32>> {
        let slot = self.slots.iter().find(|slot| slot.key == key)?;
        let values = params.as_slice().get(slot.range.clone())?;
        ArrayViewD::from_shape(IxDyn(&slot.shape), values).ok()
    }

    /// Runs the model on a batch.
    ///
    /// # Arguments
    /// * `params` - The model's parameters.
    /// * `batch` - Images laid out as `[B, 1, 28, 28]`.
    /// * `_model_state` - Ignored, the model keeps no state.
    /// * `mode` - `Train` also records the tape `backward` needs.
    /// * `_rng` - Ignored, the forward pass is deterministic.
    /// * `_update_batch_norm` - Ignored, there is no batch norm.
    ///
    /// # Returns
    /// The class scores and no auxiliary state.
    pub fn model_fn(
        &self,
        params: &Params,
        batch: &Batch,
        _model_state: Option<&AuxState>,
        mode: ForwardPassMode,
        _rng: u64,
        _update_batch_norm: bool,
    ) -> Result<(ForwardOutput, Option<AuxState>)> {
        let x = batch.inputs.to_shape((batch.len(), IMAGE_PIXELS))?;
        let (scores, tape) =
            self.net
                .forward(params.as_slice(), x.view(), mode == ForwardPassMode::Train)?;

        Ok((ForwardOutput { scores, tape }, None))
    }

    /// Masked cross-entropy with label smoothing, see `loss::cross_entropy`.
    pub fn loss_fn(
        &self,
        targets: ArrayView1<i64>,
        scores: ArrayView2<f32>,
        mask: Option<ArrayView1<f32>>,
        label_smoothing: f32,
    ) -> Result<LossOutput> {
        loss::cross_entropy(targets, scores, mask, label_smoothing)
    }

    /// The derivative of `loss_fn(..).mean` with respect to the scores.
    pub fn loss_grad(
        &self,
        targets: ArrayView1<i64>,
        scores: ArrayView2<f32>,
        mask: Option<ArrayView1<f32>>,
        label_smoothing: f32,
    ) -> Result<Array2<f32>> {
        loss::cross_entropy_grad(targets, scores, mask, label_smoothing)
    }

    /// Backpropagates `d_scores` through a recorded forward pass.
    ///
    /// # Returns
    /// The gradient, laid out like `params`.
    pub fn backward(&self, params: &Params, tape: &Tape, d_scores: Array2<f32>) -> Result<Params> {
        Ok(Params(self.net.backward(params.as_slice(), tape, d_scores)?))
    }

    /// Evaluates the model on one batch.
    ///
    /// # Returns
    /// The number of correct predictions and the summed loss, both over valid examples.
    pub fn eval_model(
        &self,
        params: &Params,
        batch: &Batch,
        model_state: Option<&AuxState>,
        rng: u64,
    ) -> Result<EvalMetrics> {
        let (out, _) = self.model_fn(
            params,
            batch,
            model_state,
            ForwardPassMode::Eval,
            rng,
            false,
        )?;
        let mask = batch.mask();

        let accuracy = Zip::from(out.scores.rows())
            .and(&batch.targets)
            .and(&mask)
            .fold(0., |acc, scores, &target, &w| {
                if argmax(scores) as i64 == target {
                    acc + w
                } else {
                    acc
                }
            });

        let loss = self
            .loss_fn(batch.targets.view(), out.scores.view(), Some(mask.view()), 0.)?
            .per_example
            .sum();

        Ok(EvalMetrics { accuracy, loss })
    }

    /// Evaluates the model on `num_examples` examples pulled from `distributor`.
    ///
    /// Every participant evaluates its own batches, the sums are then reduced among them.
    /// Examples past the first `num_examples` of the split count as padding.
    ///
    /// # Returns
    /// The accuracy and the mean loss over the examples.
    pub async fn eval_model_on_split<S, D>(
        &self,
        params: &Params,
        model_state: Option<&AuxState>,
        distributor: &mut BatchDistributor<S, D>,
        num_examples: usize,
        rng: u64,
    ) -> Result<EvalMetrics>
    where
        S: Iterator<Item = RawBatch> + Send,
        D: Distribution + Send,
    {
        if num_examples == 0 {
            return Err(WorkloadErr::Config("there are no examples to evaluate".into()));
        }

        let global = distributor.shape().global();
        let num_batches = num_examples.div_ceil(global);
        let mut totals = EvalMetrics::default();

        for i in 0..num_batches {
            let Some(mut batch) = distributor.next_batch().await? else {
                debug!(batches = i; "eval split ended early");
                break;
            };

            // Where this participant's slice starts within the split.
            let offset = i * global + distributor.rank() * batch.len();
            batch.keep_first(num_examples.saturating_sub(offset));

            totals += self.eval_model(params, &batch, model_state, rng)?;
        }

        let mut sums = totals.to_array();
        distributor.reduce_sum(&mut sums).await?;

        let metrics = EvalMetrics::from_array(sums).averaged(num_examples as f32);
        info!(
            examples = num_examples,
            accuracy = metrics.accuracy,
            loss = metrics.loss;
            "split evaluated"
        );
        Ok(metrics)
    }

    /// Builds the input pipeline of a split.
    ///
    /// The train split is shuffled every epoch and repeats forever, the others make a single
    /// pass in order unless `repeat_final_dataset` is set.
    ///
    /// # Arguments
    /// * `dataset` - The examples of the split.
    /// * `split` - Which split `dataset` is.
    /// * `seed` - Seeds the shuffling.
    /// * `shape` - The layout of every global batch.
    /// * `num_batches` - Stops after this many batches.
    /// * `repeat_final_dataset` - Cycles over an eval split.
    pub fn build_input_queue(
        &self,
        dataset: Arc<InMemoryDataset>,
        split: Split,
        seed: u64,
        shape: BatchShape,
        num_batches: Option<usize>,
        repeat_final_dataset: bool,
    ) -> InputPipeline {
        let options = match split {
            Split::Train => PipelineOptions {
                shuffle_seed: Some(seed),
                repeat: true,
                num_batches,
            },
            Split::EvalTrain | Split::Validation | Split::Test => PipelineOptions {
                shuffle_seed: None,
                repeat: repeat_final_dataset,
                num_batches,
            },
        };

        debug!(examples = dataset.len(); "input queue for {split:?}");
        InputPipeline::new(dataset, shape, options)
    }

    /// Whether a validation run is good enough to stop training.
    pub fn has_reached_validation_target(&self, metrics: &EvalMetrics) -> bool {
        metrics.accuracy > Self::VALIDATION_TARGET
    }

    pub fn has_reached_test_target(&self, metrics: &EvalMetrics) -> bool {
        metrics.accuracy > Self::TEST_TARGET
    }
}

/// Returns the index of the largest score, the first one on ties.
fn argmax(scores: ArrayView1<f32>) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &s)| {
            if s > max { (i, s) } else { (best, max) }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{CHANNELS, IMAGE_SIDE, NUM_CLASSES};
    use ndarray::{Array1, Array4, ArrayD, IxDyn, array};

    fn zeros_batch(b: usize) -> Batch {
        Batch::new(
            Array4::zeros((b, CHANNELS, IMAGE_SIDE, IMAGE_SIDE)),
            Array1::zeros(b),
            None,
        )
        .unwrap()
    }

    /// Parameters whose only non zero value is the output bias of class 3, so every example is
    /// predicted as a 3.
    fn predicts_three(workload: &MnistWorkload) -> Params {
        let mut params = Params::from_vec(vec![0.; workload.net.size()]);
        let slot = workload
            .slots
            .iter()
            .find(|slot| slot.key == "net.layer2.bias")
            .unwrap()
            .range
            .clone();
        params.as_mut_slice()[slot.start + 3] = 5.;
        params
    }

    /// Global batches of blank images of a 3, laid out for `workers` workers.
    fn threes(batches: usize, workers: usize, per_worker: usize) -> impl Iterator<Item = RawBatch> {
        let dims = [workers, per_worker];
        std::iter::repeat_with(move || RawBatch {
            inputs: ArrayD::zeros(IxDyn(&[workers, per_worker, IMAGE_SIDE, IMAGE_SIDE, CHANNELS])),
            targets: ArrayD::from_elem(IxDyn(&dims), 3),
            weights: ArrayD::ones(IxDyn(&dims)),
        })
        .take(batches)
    }

    #[test]
    fn zero_input_gives_ten_scores() {
        let workload = MnistWorkload::new();
        let (params, aux) = workload.init_model_fn(0, None, None).unwrap();
        assert!(aux.is_none());

        for b in [1, 3, 17] {
            let (out, aux) = workload
                .model_fn(&params, &zeros_batch(b), None, ForwardPassMode::Eval, 0, false)
                .unwrap();

            assert_eq!(out.scores.dim(), (b, NUM_CLASSES));
            assert!(matches!(out.tape(), Err(WorkloadErr::MissingTape)));
            assert!(aux.is_none());
        }
    }

    #[test]
    fn train_mode_records_the_tape() {
        let workload = MnistWorkload::new();
        let (params, _) = workload.init_model_fn(0, None, None).unwrap();
        let batch = zeros_batch(2);

        let (out, _) = workload
            .model_fn(&params, &batch, None, ForwardPassMode::Train, 0, true)
            .unwrap();
        let d = workload
            .loss_grad(batch.targets.view(), out.scores.view(), None, 0.)
            .unwrap();
        let grad = workload.backward(&params, out.tape().unwrap(), d).unwrap();

        assert_eq!(grad.len(), params.len());
        assert!(grad.as_slice().iter().any(|&g| g != 0.));
    }

    #[test]
    fn init_is_seeded_with_zero_biases() {
        let workload = MnistWorkload::new();
        let (a, _) = workload.init_model_fn(3, None, None).unwrap();
        let (b, _) = workload.init_model_fn(3, Some(0.1), None).unwrap();
        let (c, _) = workload.init_model_fn(4, None, None).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let bias = workload.param(&a, "net.layer1.bias").unwrap();
        assert_eq!(bias.shape(), [128]);
        assert!(bias.iter().all(|&v| v == 0.));

        let weight = workload.param(&a, "net.layer1.weight").unwrap();
        assert_eq!(weight.shape(), [128, 784]);
        let limit = 2. * (1f32 / 784.).sqrt() / 0.879_625_66;
        assert!(weight.iter().all(|v| v.abs() <= limit + 1e-6));
    }

    #[test]
    fn only_the_last_layer_is_output() {
        let workload = MnistWorkload::new();

        assert!(workload.is_output_params("net.layer2.weight"));
        assert!(workload.is_output_params("net.layer2.bias"));
        assert!(!workload.is_output_params("net.layer1.weight"));
        assert!(!workload.is_output_params("net.layer1.bias"));
        assert!(!workload.is_output_params("net_layer2.bias"));
        assert!(!workload.is_output_params("net.layer2"));
    }

    #[test]
    fn shapes_and_types_cover_every_parameter() {
        let workload = MnistWorkload::new();
        let shapes = workload.param_shapes();
        let types = workload.param_types();

        assert_eq!(shapes.len(), 4);
        assert_eq!(shapes["net.layer1.weight"], [128, 784]);
        assert_eq!(shapes["net.layer2.bias"], [10]);
        assert_eq!(types["net.layer2.weight"], ParamKind::Weight);
        assert_eq!(types["net.layer1.bias"], ParamKind::Bias);

        let total: usize = shapes.values().map(|s| s.iter().product::<usize>()).sum();
        let (params, _) = workload.init_model_fn(0, None, None).unwrap();
        assert_eq!(total, params.len());
    }

    #[test]
    fn eval_counts_valid_correct_predictions() {
        let workload = MnistWorkload::new();

        let params = predicts_three(&workload);

        let batch = Batch::new(
            Array4::zeros((4, CHANNELS, IMAGE_SIDE, IMAGE_SIDE)),
            array![3, 3, 1, 3],
            Some(array![true, true, true, false]),
        )
        .unwrap();

        let metrics = workload.eval_model(&params, &batch, None, 0).unwrap();
        assert_eq!(metrics.accuracy, 2.);

        let scores = Array2::from_shape_fn((1, NUM_CLASSES), |(_, j)| if j == 3 { 5. } else { 0. });
        let hit = loss::cross_entropy(array![3].view(), scores.view(), None, 0.).unwrap().mean;
        let miss = loss::cross_entropy(array![1].view(), scores.view(), None, 0.).unwrap().mean;
        assert!((metrics.loss - (2. * hit + miss)).abs() < 1e-4);
    }

    #[tokio::test]
    async fn split_eval_ignores_examples_past_the_limit() {
        let workload = MnistWorkload::new();
        let params = predicts_three(&workload);

        // Two global batches of 8 hold 16 examples, only the first 10 belong to the split.
        let mut distributor = BatchDistributor::local(threes(2, 4, 2), 8, 4).unwrap();
        let metrics = workload
            .eval_model_on_split(&params, None, &mut distributor, 10, 0)
            .await
            .unwrap();

        assert_eq!(metrics.accuracy, 1.);
        let one = Batch::new(
            Array4::zeros((1, CHANNELS, IMAGE_SIDE, IMAGE_SIDE)),
            array![3],
            None,
        )
        .unwrap();
        let single = workload.eval_model(&params, &one, None, 0).unwrap();
        assert!((metrics.loss - single.loss).abs() < 1e-5);
    }

    #[tokio::test]
    async fn split_eval_limit_holds_on_every_rank() {
        let workload = MnistWorkload::new();
        let params = predicts_three(&workload);

        let handles: Vec<_> = comms::collective::in_memory(4, 1 << 16)
            .unwrap()
            .into_iter()
            .map(|group| {
                let (workload, params) = (workload.clone(), params.clone());
                tokio::spawn(async move {
                    let mut distributor =
                        BatchDistributor::collective(group, 8, || threes(2, 4, 2)).unwrap();
                    workload
                        .eval_model_on_split(&params, None, &mut distributor, 10, 0)
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().accuracy, 1.);
        }
    }

    #[test]
    fn argmax_prefers_the_first_maximum() {
        assert_eq!(argmax(array![0., 2., 2., 1.].view()), 1);
        assert_eq!(argmax(array![-3., -1.].view()), 1);
    }

    #[test]
    fn validation_target_is_strict() {
        let workload = MnistWorkload::new();
        let at = EvalMetrics {
            accuracy: 0.97,
            loss: 0.,
        };
        let above = EvalMetrics {
            accuracy: 0.975,
            loss: 0.,
        };

        assert!(!workload.has_reached_validation_target(&at));
        assert!(workload.has_reached_validation_target(&above));
    }
}
