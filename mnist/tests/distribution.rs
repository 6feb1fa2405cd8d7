use std::sync::Arc;

use comms::{CommErr, collective};
use futures::TryStreamExt;
use mnist::{
    Batch, BatchDistributor, BatchShape, EvalMetrics, MnistWorkload, RawBatch, Split, WorkloadErr,
    data::{InMemoryDataset, InputPipeline},
};
use ndarray::{Array1, ArrayD, Axis, IxDyn, concatenate};
use rand::{SeedableRng, rngs::StdRng};

const WORKERS: usize = 4;
const GLOBAL: usize = 8;
const EXAMPLES: usize = 20;

fn dataset() -> Arc<InMemoryDataset> {
    Arc::new(InMemoryDataset::synthetic(
        EXAMPLES,
        &mut StdRng::seed_from_u64(5),
    ))
}

fn pipeline(dataset: Arc<InMemoryDataset>) -> InputPipeline {
    let shape = BatchShape::new(GLOBAL, WORKERS).unwrap();
    MnistWorkload::new().build_input_queue(dataset, Split::Validation, 0, shape, None, false)
}

/// Runs every rank of an in-memory group and returns the batches each one got.
async fn collective_batches(dataset: Arc<InMemoryDataset>) -> Vec<Vec<Batch>> {
    let groups = collective::in_memory(WORKERS, 1 << 16).unwrap();

    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            let dataset = dataset.clone();
            tokio::spawn(async move {
                BatchDistributor::collective(group, GLOBAL, || pipeline(dataset))
                    .unwrap()
                    .into_stream()
                    .try_collect::<Vec<_>>()
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut per_rank = Vec::new();
    for handle in handles {
        per_rank.push(handle.await.unwrap());
    }
    per_rank
}

#[tokio::test]
async fn every_rank_gets_its_slice_until_the_source_ends() {
    let per_rank = collective_batches(dataset()).await;

    // 20 examples in batches of 8: the last one is half padding.
    for batches in &per_rank {
        assert_eq!(batches.len(), 3);
        for batch in batches {
            assert_eq!(batch.inputs.dim(), (GLOBAL / WORKERS, 1, 28, 28));
            assert_eq!(batch.len(), GLOBAL / WORKERS);
        }
    }

    let valid: Vec<f32> = per_rank.iter().map(|b| b[2].mask().sum()).collect();
    assert_eq!(valid, [2., 2., 0., 0.]);
}

#[tokio::test]
async fn collective_and_local_modes_see_the_same_data() {
    let per_rank = collective_batches(dataset()).await;
    let local: Vec<Batch> = BatchDistributor::local(pipeline(dataset()), GLOBAL, WORKERS)
        .unwrap()
        .into_stream()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(local.len(), 3);
    for (step, whole) in local.iter().enumerate() {
        assert_eq!(whole.inputs.dim(), (GLOBAL, 1, 28, 28));

        let inputs: Vec<_> = per_rank.iter().map(|b| b[step].inputs.view()).collect();
        let targets: Vec<_> = per_rank.iter().map(|b| b[step].targets.view()).collect();
        let masks: Vec<Array1<f32>> = per_rank.iter().map(|b| b[step].mask()).collect();
        let masks: Vec<_> = masks.iter().map(|m| m.view()).collect();

        assert_eq!(concatenate(Axis(0), &inputs).unwrap(), whole.inputs);
        assert_eq!(concatenate(Axis(0), &targets).unwrap(), whole.targets);
        assert_eq!(concatenate(Axis(0), &masks).unwrap(), whole.mask());
    }
}

#[tokio::test]
async fn indivisible_global_batch_is_rejected_on_every_rank() {
    for group in collective::in_memory(3, 64).unwrap() {
        let err = BatchDistributor::collective(group, GLOBAL, || pipeline(dataset())).err();
        assert!(matches!(
            err,
            Some(WorkloadErr::IndivisibleBatch {
                global: GLOBAL,
                workers: 3
            })
        ));
    }
}

#[tokio::test]
async fn malformed_source_batch_fails_every_rank() {
    // Laid out for 2 workers while the group has 4.
    let malformed = || {
        std::iter::once(RawBatch {
            inputs: ArrayD::zeros(IxDyn(&[2, 4, 28, 28, 1])),
            targets: ArrayD::zeros(IxDyn(&[2, 4])),
            weights: ArrayD::ones(IxDyn(&[2, 4])),
        })
    };

    let handles: Vec<_> = collective::in_memory(WORKERS, 1 << 16)
        .unwrap()
        .into_iter()
        .map(|group| {
            tokio::spawn(async move {
                BatchDistributor::collective(group, GLOBAL, malformed)
                    .unwrap()
                    .next_batch()
                    .await
                    .err()
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert!(matches!(
        results[0],
        Some(WorkloadErr::ShapeMismatch { what: "inputs", .. })
    ));
    for err in &results[1..] {
        assert!(matches!(err, Some(WorkloadErr::Comm(CommErr::Peer(_)))));
    }
}

#[tokio::test]
async fn split_evaluation_agrees_across_modes() {
    let workload = MnistWorkload::new();
    let (params, _) = workload.init_model_fn(1, None, None).unwrap();

    let mut local = BatchDistributor::local(pipeline(dataset()), GLOBAL, WORKERS).unwrap();
    let expected = workload
        .eval_model_on_split(&params, None, &mut local, EXAMPLES, 0)
        .await
        .unwrap();
    assert!((0. ..=1.).contains(&expected.accuracy));
    assert!(expected.loss > 0.);

    let handles: Vec<_> = collective::in_memory(WORKERS, 1 << 16)
        .unwrap()
        .into_iter()
        .map(|group| {
            let (workload, params) = (workload.clone(), params.clone());
            tokio::spawn(async move {
                let mut distributor =
                    BatchDistributor::collective(group, GLOBAL, || pipeline(dataset())).unwrap();
                workload
                    .eval_model_on_split(&params, None, &mut distributor, EXAMPLES, 0)
                    .await
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        let got: EvalMetrics = handle.await.unwrap();
        assert!((got.accuracy - expected.accuracy).abs() < 1e-5);
        assert!((got.loss - expected.loss).abs() < 1e-4);
    }
}
