use std::{env, io, sync::Arc};

use comms::bootstrap::{self, TcpGroup};
use log::{info, warn};
use mnist::{
    BatchDistributor, BatchShape, ExecutionMode, ForwardPassMode, MnistWorkload, Params,
    RawBatch, Split, Topology, WorkloadConfig, data::InMemoryDataset,
    distributor::Distribution,
};
use rand::{SeedableRng, rngs::StdRng};
use tokio::{net::TcpListener, signal};

const DEFAULT_HOST: &str = "127.0.0.1";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = match env::var("CONFIG") {
        Ok(path) => WorkloadConfig::load(path)?,
        Err(_) => WorkloadConfig::default(),
    };
    let topology = Topology::from_env()?;

    tokio::select! {
        ret = run(config, topology) => {
            ret?;
            info!("wrapping up");
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT");
        }
    }

    Ok(())
}

async fn run(config: WorkloadConfig, topology: Topology) -> mnist::Result<()> {
    let workload = MnistWorkload::new();
    let (mut params, _) = workload.init_model_fn(config.seed, None, None)?;

    let dataset = Arc::new(InMemoryDataset::synthetic(
        config.synthetic_examples,
        &mut StdRng::seed_from_u64(config.seed),
    ));
    let eval_examples = config.eval_examples.min(dataset.len());
    let shape = BatchShape::new(config.global_batch_size, topology.num_workers())?;

    let train_queue = || {
        workload.build_input_queue(
            dataset.clone(),
            Split::Train,
            config.seed,
            shape,
            Some(config.steps),
            false,
        )
    };
    let eval_queue = || {
        workload.build_input_queue(dataset.clone(), Split::EvalTrain, config.seed, shape, None, false)
    };

    let metrics = match topology.mode() {
        ExecutionMode::LocalReshape => {
            let num_devices = topology.num_workers();

            let mut train =
                BatchDistributor::local(train_queue(), config.global_batch_size, num_devices)?;
            train_steps(&workload, &config, &mut params, &mut train).await?;

            let mut eval =
                BatchDistributor::local(eval_queue(), config.global_batch_size, num_devices)?;
            workload
                .eval_model_on_split(&params, None, &mut eval, eval_examples, config.seed)
                .await?
        }
        ExecutionMode::Collective => {
            let group = process_group(&topology).await?;

            let mut train =
                BatchDistributor::collective(group, config.global_batch_size, train_queue)?;
            train_steps(&workload, &config, &mut params, &mut train).await?;

            let group = train.into_strategy().into_group();
            let mut eval =
                BatchDistributor::collective(group, config.global_batch_size, eval_queue)?;
            workload
                .eval_model_on_split(&params, None, &mut eval, eval_examples, config.seed)
                .await?
        }
    };

    info!(
        accuracy = metrics.accuracy,
        loss = metrics.loss,
        reached_target = workload.has_reached_validation_target(&metrics);
        "evaluation done"
    );
    Ok(())
}

/// Binds on rank 0 and connects everywhere else.
async fn process_group(topology: &Topology) -> io::Result<TcpGroup> {
    let addr = format!(
        "{}:{}",
        env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        env::var("PORT").map_err(io::Error::other)?,
    );

    if topology.is_coordinator() {
        let listener = TcpListener::bind(&addr).await?;
        info!("listening at {addr}");
        Ok(bootstrap::accept(&listener, topology.num_workers()).await?)
    } else {
        Ok(bootstrap::connect(addr.as_str(), topology.rank(), topology.num_workers()).await?)
    }
}

/// Plain data-parallel gradient descent: every replica's gradient is summed and averaged.
async fn train_steps<S, D>(
    workload: &MnistWorkload,
    config: &WorkloadConfig,
    params: &mut Params,
    distributor: &mut BatchDistributor<S, D>,
) -> mnist::Result<()>
where
    S: Iterator<Item = RawBatch> + Send,
    D: Distribution + Send,
{
    let replicas = distributor.replicas() as f32;

    for step in 0..config.steps {
        let Some(batch) = distributor.next_batch().await? else {
            warn!(step = step; "train stream ended early");
            break;
        };

        let (out, _) = workload.model_fn(
            params,
            &batch,
            None,
            ForwardPassMode::Train,
            config.seed,
            true,
        )?;
        let mask = batch.mask();
        let targets = batch.targets.view();

        let loss = workload.loss_fn(
            targets,
            out.scores.view(),
            Some(mask.view()),
            config.label_smoothing,
        )?;
        let d_scores = workload.loss_grad(
            targets,
            out.scores.view(),
            Some(mask.view()),
            config.label_smoothing,
        )?;

        let mut grad = workload.backward(params, out.tape()?, d_scores)?;
        distributor.reduce_sum(grad.as_mut_slice()).await?;

        let lr = config.learning_rate / replicas;
        let mut norm = 0.;
        for (p, g) in params.as_mut_slice().iter_mut().zip(grad.as_slice()) {
            *p -= lr * g;
            norm += g * g;
        }

        info!(
            step = step,
            loss = loss.mean,
            grad_norm = f32::sqrt(norm) / replicas;
            "train step"
        );
    }

    Ok(())
}
