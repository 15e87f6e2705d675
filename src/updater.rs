// src/updater.rs

//! Wish updates.
//!
//! Updating a wish builds this task tree and runs it:
//!
//! ```text
//! Update wish <uri>
//! ├── Expand wildcards           (abort parent on failure)
//! └── Convert images             (successor of Expand wildcards)
//!     ├── Update image <ref>     (continue on failure)
//!     └── ...
//! ```
//!
//! Root tasks are kept in a [`TaskRegistry`] so their status can be polled
//! by id while they run and after they finish.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow, bail};
use tracing::{debug, info, warn};

use crate::collab::{Fetcher, Ingestor, Store};
use crate::errors::{DuccError, Result};
use crate::ingest::{ChainIngester, IngestSettings, TarDownloader};
use crate::model::{ImageRef, Wish};
use crate::pipeline::{ImageJob, UpdateContext, UpdateImagePipeline};
use crate::sched::{OnFailure, ResourcePool, StatusNode, Task, TaskStatus};

/// Root tasks by id.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<BTreeMap<u64, Arc<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: &Arc<Task>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id(), Arc::clone(task));
    }

    pub fn get(&self, id: u64) -> Option<Arc<Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Registered tasks in id order.
    pub fn list(&self) -> Vec<Arc<Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn status(&self, id: u64) -> Option<StatusNode> {
        self.get(id).map(|task| task.status_tree())
    }

    /// Interrupt every registered task that has not finished.
    pub fn interrupt_all(&self, status: TaskStatus) {
        for task in self.list() {
            task.interrupt(status);
        }
    }
}

/// Resolve a wish input to the concrete images it names.
///
/// Wildcard tags are matched against the registry's tag list; any other
/// input (a concrete tag or a digest) is used as is.
pub async fn expand_wildcards(fetcher: &dyn Fetcher, input: &ImageRef) -> anyhow::Result<Vec<ImageRef>> {
    if !input.is_wildcard() {
        return Ok(vec![input.clone()]);
    }
    let pattern = input.tag.as_deref().unwrap_or("*");
    let tags = fetcher.fetch_tags(input, pattern).await?;
    if tags.is_empty() {
        bail!("no matching tags for {input}");
    }
    Ok(tags.iter().map(|tag| input.with_tag(tag)).collect())
}

pub struct Updater {
    pool: Arc<ResourcePool>,
    fetcher: Arc<dyn Fetcher>,
    ingestor: Arc<dyn Ingestor>,
    store: Arc<dyn Store>,
    chains: Arc<ChainIngester>,
    settings: IngestSettings,
    registry: TaskRegistry,
}

impl Updater {
    pub fn new(
        pool: Arc<ResourcePool>,
        fetcher: Arc<dyn Fetcher>,
        ingestor: Arc<dyn Ingestor>,
        store: Arc<dyn Store>,
        settings: IngestSettings,
    ) -> Arc<Self> {
        let downloader = Arc::new(TarDownloader::new(
            Arc::clone(&fetcher),
            Arc::clone(&pool),
            settings.clone(),
        ));
        let chains = ChainIngester::new(
            downloader,
            Arc::clone(&ingestor),
            Arc::clone(&pool),
            settings.clone(),
        );
        Arc::new(Self {
            pool,
            fetcher,
            ingestor,
            store,
            chains,
            settings,
            registry: TaskRegistry::new(),
        })
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn chains(&self) -> &Arc<ChainIngester> {
        &self.chains
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Build and start the task tree for wish `wish_id`; returns its root
    /// without waiting.
    pub fn start_wish_update(self: &Arc<Self>, wish_id: u64) -> Result<Arc<Task>> {
        let wish = self
            .store
            .wish(wish_id)?
            .ok_or(DuccError::WishNotFound(wish_id))?;

        let root = Task::new(format!("Update wish {}", wish.input_uri), &self.pool, 0);
        let expand = Task::new("Expand wildcards", &self.pool, self.settings.max_retries);
        let convert = Task::new("Convert images", &self.pool, 0);

        expand.add_required_resources([self
            .settings
            .registry_resource(&self.pool, &wish.input.registry)])?;
        root.add_child(&expand, OnFailure::Abort)?;
        expand.then(&convert, OnFailure::Abort, OnFailure::Abort)?;

        self.registry.register(&root);
        info!(task_id = root.id(), wish = wish.id, input = %wish.input_uri, "starting wish update");

        let expanded: Arc<Mutex<Option<Vec<ImageRef>>>> = Arc::new(Mutex::new(None));

        {
            let this = Arc::clone(self);
            let input = wish.input.clone();
            let expanded = Arc::clone(&expanded);
            tokio::spawn(async move {
                expand
                    .run(|task| {
                        let this = Arc::clone(&this);
                        let input = input.clone();
                        let expanded = Arc::clone(&expanded);
                        async move {
                            let images = expand_wildcards(this.fetcher.as_ref(), &input).await?;
                            task.info(format!("expanded to {} image(s)", images.len()));
                            *expanded.lock().unwrap_or_else(PoisonError::into_inner) = Some(images);
                            Ok(())
                        }
                    })
                    .await
            });
        }

        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                convert
                    .run(|task| {
                        let this = Arc::clone(&this);
                        let wish = wish.clone();
                        let images = expanded
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        async move {
                            let images = images.ok_or_else(|| anyhow!("wildcards were not expanded"))?;
                            // Detached: an interrupt must not drop image tasks
                            // that are already attached to `task`.
                            tokio::spawn(async move { this.convert_images(&task, &wish, images).await })
                                .await
                                .map_err(|err| anyhow!("image conversion panicked: {err}"))?
                        }
                    })
                    .await
            });
        }

        {
            let root = Arc::clone(&root);
            tokio::spawn(async move {
                if let Err(err) = root.start_when_ready().await {
                    root.warn(format!("not started: {err}"));
                    return root.complete_when_ready(TaskStatus::Aborted).await;
                }
                let requested = tokio::select! {
                    status = root.interrupted() => status,
                    _ = all_children_done(&root) => TaskStatus::Success,
                };
                root.complete_when_ready(requested).await
            });
        }

        Ok(root)
    }

    /// Update wish `wish_id` and wait for the outcome.
    pub async fn update_wish(self: &Arc<Self>, wish_id: u64) -> Result<Arc<Task>> {
        let root = self.start_wish_update(wish_id)?;
        root.wait_done().await;
        Ok(root)
    }

    async fn convert_images(
        &self,
        task: &Arc<Task>,
        wish: &Wish,
        images: Vec<ImageRef>,
    ) -> anyhow::Result<()> {
        let jobs = self.sync_images(task, wish, &images)?;
        let total = jobs.len();

        let pipeline = UpdateImagePipeline::spawn(UpdateContext {
            fetcher: Arc::clone(&self.fetcher),
            ingestor: Arc::clone(&self.ingestor),
            store: Arc::clone(&self.store),
            chains: Arc::clone(&self.chains),
            pool: Arc::clone(&self.pool),
            settings: self.settings.clone(),
            concurrency: self.settings.registry_concurrency,
        });

        let mut children = Vec::with_capacity(total);
        for (image_id, image) in jobs {
            if task.interrupt_status().is_some() {
                warn!(wish = wish.id, "interrupted, not queueing further images");
                break;
            }
            let child = Task::new(format!("Update image {image}"), &self.pool, 0);
            task.add_child(&child, OnFailure::Continue)?;
            children.push(Arc::clone(&child));

            if let Err(err) = child.start_when_ready().await {
                child.warn(format!("not started: {err}"));
                child.complete_when_ready(TaskStatus::Aborted).await;
                continue;
            }

            let job = ImageJob {
                task: child,
                image,
                image_id,
                cvmfs_repo: wish.cvmfs_repo.clone(),
            };
            if let Err(job) = pipeline.submit(job).await {
                job.task.error("update pipeline closed before the image was queued");
                job.task.complete_when_ready(TaskStatus::Failed).await;
            }
        }
        pipeline.close().await;

        let mut failed = 0;
        for child in &children {
            let status = child.wait_done().await;
            if status != TaskStatus::Success {
                failed += 1;
            }
        }
        if failed > 0 {
            bail!("{failed} of {total} image(s) failed to update");
        }
        task.info(format!("{total} image(s) up to date"));
        Ok(())
    }

    /// Record the wish's current images in the store, dropping links to
    /// images that no longer match. Returns `(image id, image)` pairs.
    fn sync_images(
        &self,
        task: &Task,
        wish: &Wish,
        images: &[ImageRef],
    ) -> anyhow::Result<Vec<(u64, ImageRef)>> {
        let mut current = BTreeSet::new();
        let mut jobs = Vec::with_capacity(images.len());
        for image in images {
            let record = self
                .store
                .upsert_image(image)
                .with_context(|| format!("recording image {image}"))?;
            self.store.link_image(wish.id, record.id)?;
            current.insert(record.id);
            jobs.push((record.id, record.image));
        }

        for stale in self.store.images_for_wish(wish.id)? {
            if !current.contains(&stale.id) {
                debug!(wish = wish.id, image = %stale.image, "unlinking image");
                task.warn(format!("{} no longer matches, unlinking", stale.image));
                self.store.unlink_image(wish.id, stale.id)?;
            }
        }

        if jobs.is_empty() {
            warn!(wish = wish.id, "wish has no images");
        }
        Ok(jobs)
    }
}

async fn all_children_done(task: &Task) {
    for child in task.children() {
        child.wait_done().await;
    }
}
