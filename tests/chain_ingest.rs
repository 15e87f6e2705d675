// tests/chain_ingest.rs

mod common;
use crate::common::builders::{ManifestBuilder, layer};
use crate::common::fakes::{FakeFetcher, FakeIngestor, Fault, ingest_key, tarball_key};
use crate::common::{init_tracing, with_timeout};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ducc::ingest::{ChainIngester, IngestSettings, TarDownloader};
use ducc::model::{Chain, ImageRef};
use ducc::sched::{CONTAINER_REGISTRY_RESOURCE_PREFIX, CoordinatorError, ResourcePool};

const REPO: &str = "unpacked.example.org";

struct Rig {
    fetcher: Arc<FakeFetcher>,
    ingestor: Arc<FakeIngestor>,
    pool: Arc<ResourcePool>,
    chains: Arc<ChainIngester>,
    tars: TempDir,
}

fn rig(configure: impl FnOnce(&mut IngestSettings)) -> Rig {
    init_tracing();
    let tars = TempDir::new().unwrap();
    let mut settings = IngestSettings {
        tar_cache_dir: tars.path().join("tars"),
        ..IngestSettings::default()
    };
    configure(&mut settings);

    let fetcher = FakeFetcher::new();
    let ingestor = FakeIngestor::new();
    let pool = Arc::new(ResourcePool::new());
    let downloader = Arc::new(TarDownloader::new(
        fetcher.clone(),
        Arc::clone(&pool),
        settings.clone(),
    ));
    let chains = ChainIngester::new(downloader, ingestor.clone(), Arc::clone(&pool), settings);

    Rig {
        fetcher,
        ingestor,
        pool,
        chains,
        tars,
    }
}

impl Rig {
    fn image(&self, name: &str, layers: &[&str]) -> (ImageRef, Arc<Chain>) {
        let manifest = ManifestBuilder::new(name).layers(layers).build();
        let chain = Arc::new(Chain::from_manifest(&manifest));
        let image = self
            .fetcher
            .add_image(&format!("registry.example.org/library/{name}:1"), manifest);
        (image, chain)
    }

    fn tar_files(&self) -> usize {
        count_files(&self.tars.path().join("tars"))
    }
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

fn chain_ids(chain: &Chain) -> Vec<(String, String)> {
    chain
        .links
        .iter()
        .map(|l| (REPO.to_string(), l.chain_id.clone()))
        .collect()
}

#[tokio::test]
async fn top_step_pulls_in_every_predecessor_in_order() {
    let rig = rig(|_| {});
    let (image, chain) = rig.image("app", &["base", "libs", "app"]);
    let never = CancellationToken::new();

    let lease = with_timeout(rig.chains.ingest(REPO, &image, &chain, 2, &never))
        .await
        .unwrap();

    assert_eq!(lease.chain_id, chain.top().unwrap());
    assert_eq!(lease.parent.as_deref(), Some(chain.links[1].chain_id.as_str()));
    assert!(!lease.reused);
    assert_eq!(rig.ingestor.ingested(), chain_ids(&chain));

    drop(lease);
    assert!(rig.chains.coordinator().is_empty());
    assert!(rig.chains.downloader().coordinator().is_empty());
    assert_eq!(rig.tar_files(), 0, "tarballs are removed after ingestion");
}

#[tokio::test(start_paused = true)]
async fn shared_prefix_is_ingested_and_downloaded_once() {
    let rig = rig(|_| {});
    rig.fetcher.set_latency(Duration::from_millis(20));
    rig.ingestor.set_latency(Duration::from_millis(20));
    let (first, first_chain) = rig.image("web", &["base", "libs", "web"]);
    let (second, second_chain) = rig.image("worker", &["base", "libs", "worker"]);
    let never = CancellationToken::new();

    let (a, b) = tokio::join!(
        rig.chains.ingest(REPO, &first, &first_chain, 2, &never),
        rig.chains.ingest(REPO, &second, &second_chain, 2, &never),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(first_chain.links[1].chain_id, second_chain.links[1].chain_id);
    assert_eq!(rig.ingestor.ingested().len(), 4);
    for seed in ["base", "libs", "web", "worker"] {
        assert_eq!(rig.fetcher.calls(&tarball_key(&layer(seed).digest)), 1, "{seed}");
    }
    for link in &first_chain.links[..2] {
        assert_eq!(rig.ingestor.calls(&ingest_key(REPO, &link.chain_id)), 1);
    }

    drop((a, b));
    assert!(rig.chains.coordinator().is_empty());
    assert_eq!(rig.tar_files(), 0);
}

#[tokio::test]
async fn steps_already_in_the_repository_are_reused() {
    let rig = rig(|_| {});
    let (image, chain) = rig.image("app", &["base", "libs", "app"]);
    rig.ingestor.add_step(REPO, &chain.links[0].chain_id);
    rig.ingestor.add_step(REPO, &chain.links[1].chain_id);
    let never = CancellationToken::new();

    let middle = rig.chains.ingest(REPO, &image, &chain, 1, &never).await.unwrap();
    assert!(middle.reused);

    let top = rig.chains.ingest(REPO, &image, &chain, 2, &never).await.unwrap();
    assert!(!top.reused);
    assert_eq!(
        rig.ingestor.ingested(),
        vec![(REPO.to_string(), chain.links[2].chain_id.clone())]
    );
    assert_eq!(rig.fetcher.calls(&tarball_key(&layer("base").digest)), 0);
    assert_eq!(rig.fetcher.calls(&tarball_key(&layer("app").digest)), 1);
}

#[tokio::test]
async fn out_of_range_step_fails_without_work() {
    let rig = rig(|_| {});
    let (image, chain) = rig.image("app", &["base"]);

    let err = rig
        .chains
        .ingest(REPO, &image, &chain, 5, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::Failed { message, .. } if message.contains("no step 5")));
    assert!(rig.ingestor.ingested().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_download_backs_off_and_retries() {
    let rig = rig(|_| {});
    let (image, chain) = rig.image("app", &["base"]);
    rig.fetcher.inject(
        &tarball_key(&layer("base").digest),
        Fault::RateLimited(Duration::from_secs(30)),
    );

    let start = Instant::now();
    let lease = rig
        .chains
        .ingest(REPO, &image, &chain, 0, &CancellationToken::new())
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(30), "elapsed {:?}", start.elapsed());
    assert_eq!(rig.fetcher.calls(&tarball_key(&layer("base").digest)), 2);
    assert_eq!(lease.chain_id, chain.links[0].chain_id);

    let registry = rig
        .pool
        .get(&format!("{CONTAINER_REGISTRY_RESOURCE_PREFIX}registry.example.org"))
        .unwrap();
    assert_eq!(registry.available(), registry.capacity());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_step_and_drop_the_tarball() {
    let rig = rig(|s| s.max_retries = 1);
    let (image, chain) = rig.image("app", &["base"]);
    let key = ingest_key(REPO, &chain.links[0].chain_id);
    rig.ingestor.inject(&key, Fault::Fail("disk full".to_string()));
    rig.ingestor.inject(&key, Fault::Fail("disk full".to_string()));

    let err = rig
        .chains
        .ingest(REPO, &image, &chain, 0, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(&err, CoordinatorError::Failed { message, .. } if message.contains("disk full")));
    assert_eq!(rig.ingestor.calls(&key), 2);
    assert!(!rig.ingestor.has_step(REPO, &chain.links[0].chain_id));
    assert!(rig.chains.coordinator().is_empty());
    assert_eq!(rig.tar_files(), 0);
}

#[tokio::test(start_paused = true)]
async fn repository_concurrency_limits_parallel_ingestion() {
    let rig = rig(|s| s.repository_concurrency = 1);
    rig.ingestor.set_latency(Duration::from_millis(50));
    let (a, a_chain) = rig.image("a", &["a-only"]);
    let (b, b_chain) = rig.image("b", &["b-only"]);
    let (c, c_chain) = rig.image("c", &["c-only"]);
    let never = CancellationToken::new();

    let (ra, rb, rc) = tokio::join!(
        rig.chains.ingest(REPO, &a, &a_chain, 0, &never),
        rig.chains.ingest(REPO, &b, &b_chain, 0, &never),
        rig.chains.ingest(REPO, &c, &c_chain, 0, &never),
    );
    assert!(ra.is_ok() && rb.is_ok() && rc.is_ok());
    assert_eq!(rig.ingestor.ingested().len(), 3);
    assert_eq!(rig.ingestor.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_only_requester_stops_ingestion() {
    let rig = rig(|_| {});
    rig.fetcher.set_latency(Duration::from_secs(10));
    let (image, chain) = rig.image("app", &["base", "app"]);
    let cancel = CancellationToken::new();

    let pending = rig.chains.ingest(REPO, &image, &chain, 1, &cancel);
    let handle = tokio::spawn(pending);
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, CoordinatorError::Cancelled { .. }));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rig.ingestor.ingested().is_empty());
    assert!(rig.chains.coordinator().is_empty());
    assert_eq!(rig.tar_files(), 0);
}
