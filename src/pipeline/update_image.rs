// src/pipeline/update_image.rs

//! The image-update workflow, wired from generic stages:
//!
//! ```text
//! submit -> fetch manifest -> check repository --up to date------------------+
//!                                  | needs conversion                        |
//!                                  v                                         v
//!                              broadcast --[1]--------------> sync_pair --> finish
//!                                  | [0]                         ^    |
//!                                  v                             |    v
//!                              scatter -> ingest chain step -> gather  sink (releases leases)
//! ```
//!
//! Every submitted image carries its own task. The task is completed by the
//! stage that settles the image: `finish` on the normal path, or the stage
//! where the image failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::collab::{Fetcher, Ingestor, Store};
use crate::ingest::{ChainIngester, ChainLease, IngestSettings, run_exclusive};
use crate::model::{Chain, ImageRef, Manifest};
use crate::pipeline::channel::{Producer, RefCountedChannel, link};
use crate::pipeline::stages::{broadcast, gather, scatter, sink, sync_pair, transform};
use crate::pipeline::tag::Tagged;
use crate::sched::{ResourcePool, Task, TaskStatus};

/// Everything the workflow needs from the outside.
#[derive(Clone)]
pub struct UpdateContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub ingestor: Arc<dyn Ingestor>,
    pub store: Arc<dyn Store>,
    pub chains: Arc<ChainIngester>,
    pub pool: Arc<ResourcePool>,
    pub settings: IngestSettings,
    /// Items processed at once by the manifest and layer stages.
    pub concurrency: usize,
}

/// One image to bring up to date. `task` must already be running.
#[derive(Debug)]
pub struct ImageJob {
    pub task: Arc<Task>,
    pub image: ImageRef,
    pub image_id: u64,
    pub cvmfs_repo: String,
}

#[derive(Debug, Clone)]
struct ImageWork {
    job: Arc<ImageJob>,
    manifest: Arc<Manifest>,
    chain: Arc<Chain>,
    up_to_date: bool,
    failed_layers: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
struct LayerWork {
    work: ImageWork,
    step: usize,
}

async fn settle(task: &Task, requested: TaskStatus) -> TaskStatus {
    let status = match (requested, task.interrupt_status()) {
        (TaskStatus::Success, _) => TaskStatus::Success,
        (_, Some(interrupted)) => interrupted,
        (other, None) => other,
    };
    task.complete_when_ready(status).await
}

async fn fail(task: &Task, message: String) {
    task.error(message);
    settle(task, TaskStatus::Failed).await;
}

/// A running instance of the workflow.
pub struct UpdateImagePipeline {
    input: Producer<Tagged<ImageJob>>,
    stages: Vec<JoinHandle<()>>,
    sink: JoinHandle<usize>,
}

impl UpdateImagePipeline {
    pub fn spawn(ctx: UpdateContext) -> Self {
        let (input, submitted) = link::<Tagged<ImageJob>>();
        let (fetched_tx, fetched) = link::<Tagged<ImageWork>>();
        let (convert_tx, convert) = link::<Tagged<ImageWork>>();
        let (to_scatter_tx, to_scatter) = link::<Tagged<ImageWork>>();
        let (to_sync_tx, to_sync) = link::<Tagged<ImageWork>>();
        let (layers_tx, layers) = link::<Tagged<LayerWork>>();
        let (ingested_tx, ingested) = link::<Tagged<Option<ChainLease>>>();
        let (gathered_tx, gathered) = link::<Tagged<Vec<Option<ChainLease>>>>();
        let (leases_tx, leases) = link::<Tagged<Vec<Option<ChainLease>>>>();

        // Fed by both the up-to-date path and the conversion path.
        let finish_channel = RefCountedChannel::<Tagged<ImageWork>>::new();
        let up_to_date_tx = finish_channel.producer();
        let converted_tx = finish_channel.producer();
        let to_finish = finish_channel.into_receiver();

        let stages = vec![
            fetch_manifest(ctx.clone(), submitted, fetched_tx),
            check_repository(ctx.clone(), fetched, convert_tx, up_to_date_tx),
            broadcast(convert, vec![to_scatter_tx, to_sync_tx]),
            scatter(to_scatter, layers_tx, |work: &ImageWork| {
                (0..work.chain.len())
                    .map(|step| LayerWork {
                        work: work.clone(),
                        step,
                    })
                    .collect()
            }),
            ingest_layers(ctx.clone(), layers, ingested_tx),
            gather(ingested, gathered_tx),
            sync_pair(to_sync, gathered, converted_tx, leases_tx),
            finish(ctx, to_finish),
        ];

        Self {
            input,
            stages,
            sink: sink(leases),
        }
    }

    /// Queue one image. Gives the job back if the pipeline is shutting down.
    pub async fn submit(&self, job: ImageJob) -> Result<(), ImageJob> {
        self.input
            .send(Tagged::root(job))
            .await
            .map_err(|tagged| tagged.value)
    }

    /// Close the input and wait until every submitted image is settled.
    pub async fn close(self) {
        drop(self.input);
        for stage in self.stages {
            if let Err(err) = stage.await {
                tracing::error!(error = %err, "pipeline stage panicked");
            }
        }
        match self.sink.await {
            Ok(drained) => debug!(images = drained, "update pipeline drained"),
            Err(err) => tracing::error!(error = %err, "pipeline sink panicked"),
        }
    }
}

fn fetch_manifest(
    ctx: UpdateContext,
    input: mpsc::Receiver<Tagged<ImageJob>>,
    output: Producer<Tagged<ImageWork>>,
) -> JoinHandle<()> {
    let concurrency = ctx.concurrency;
    transform(input, output, concurrency, move |item: Tagged<ImageJob>| {
        let ctx = ctx.clone();
        async move {
            let job = Arc::new(item.value);
            let task = &job.task;
            task.info(format!("fetching manifest for {}", job.image));

            let resource = ctx.settings.registry_resource(&ctx.pool, &job.image.registry);
            let fetched = run_exclusive(
                &ctx.pool,
                format!("Fetch manifest {}", job.image),
                resource,
                ctx.settings.max_retries,
                &task.cancellation_token(),
                || {
                    let fetcher = &ctx.fetcher;
                    let image = &job.image;
                    async move { Ok(fetcher.fetch_manifest(image).await?) }
                },
            )
            .await;

            let manifest = match fetched {
                Ok(manifest) => manifest,
                Err(err) => {
                    fail(task, format!("failed to fetch manifest: {err:#}")).await;
                    return None;
                }
            };

            let chain = Chain::from_manifest(&manifest);
            task.info(format!(
                "manifest has {} layer(s), {} in chain",
                manifest.layers.len(),
                chain.len()
            ));
            Some(Tagged {
                tags: item.tags,
                value: ImageWork {
                    job: Arc::clone(&job),
                    manifest: Arc::new(manifest),
                    chain: Arc::new(chain),
                    up_to_date: false,
                    failed_layers: Arc::new(AtomicUsize::new(0)),
                },
            })
        }
    })
}

fn check_repository(
    ctx: UpdateContext,
    mut input: mpsc::Receiver<Tagged<ImageWork>>,
    convert: Producer<Tagged<ImageWork>>,
    up_to_date: Producer<Tagged<ImageWork>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut item) = input.recv().await {
            let job = Arc::clone(&item.value.job);
            if item.value.chain.is_empty() {
                fail(&job.task, "image has no layers to convert".to_string()).await;
                continue;
            }

            let published = ctx
                .ingestor
                .published_manifest(&job.cvmfs_repo, &job.image)
                .await;
            let target = match published {
                Ok(Some(existing)) if existing == *item.value.manifest => {
                    job.task.info(format!("{} is already up to date", job.image));
                    item.value.up_to_date = true;
                    &up_to_date
                }
                Ok(_) => {
                    job.task.info(format!("{} needs conversion", job.image));
                    &convert
                }
                Err(err) => {
                    fail(&job.task, format!("failed to read published manifest: {err}")).await;
                    continue;
                }
            };

            if target.send(item).await.is_err() {
                return;
            }
        }
    })
}

fn ingest_layers(
    ctx: UpdateContext,
    input: mpsc::Receiver<Tagged<LayerWork>>,
    output: Producer<Tagged<Option<ChainLease>>>,
) -> JoinHandle<()> {
    let concurrency = ctx.concurrency;
    transform(input, output, concurrency, move |item: Tagged<LayerWork>| {
        let chains = Arc::clone(&ctx.chains);
        async move {
            let LayerWork { work, step } = &item.value;
            let job = &work.job;
            let total = work.chain.len();
            job.task
                .info(format!("ingesting chain step {}/{total}", step + 1));

            let lease = chains
                .ingest(
                    &job.cvmfs_repo,
                    &job.image,
                    &work.chain,
                    *step,
                    &job.task.cancellation_token(),
                )
                .await;

            let outcome = match lease {
                Ok(lease) => {
                    job.task.info(format!(
                        "chain step {}/{total} ready ({})",
                        step + 1,
                        lease.chain_id
                    ));
                    Some(lease)
                }
                Err(err) => {
                    work.failed_layers.fetch_add(1, Ordering::AcqRel);
                    job.task
                        .error(format!("chain step {}/{total} failed: {err}", step + 1));
                    None
                }
            };
            Some(item.with_value(outcome))
        }
    })
}

fn finish(ctx: UpdateContext, mut input: mpsc::Receiver<Tagged<ImageWork>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let work = item.value;
            let job = &work.job;

            let failed = work.failed_layers.load(Ordering::Acquire);
            if failed > 0 {
                fail(&job.task, format!("{failed} chain step(s) failed")).await;
                continue;
            }

            if !work.up_to_date {
                let Some(top) = work.chain.top() else {
                    fail(&job.task, "image has no layers to convert".to_string()).await;
                    continue;
                };
                if let Err(err) = ctx
                    .ingestor
                    .publish_image(&job.cvmfs_repo, &job.image, &work.manifest, top)
                    .await
                {
                    fail(&job.task, format!("failed to publish image: {err}")).await;
                    continue;
                }
            }

            if let Err(err) = ctx.store.set_manifest(job.image_id, &work.manifest) {
                fail(&job.task, format!("failed to record manifest: {err}")).await;
                continue;
            }

            info!(image = %job.image, repo = %job.cvmfs_repo, up_to_date = work.up_to_date, "image updated");
            settle(&job.task, TaskStatus::Success).await;
        }
    })
}
