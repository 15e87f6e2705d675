// tests/pipeline_stages.rs

mod common;
use crate::common::{Gauge, init_tracing, with_timeout};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use ducc::pipeline::{
    RefCountedChannel, Tagged, broadcast, gather, link, scatter, sink, sync, sync_pair, transform,
};

async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(v) = rx.recv().await {
        out.push(v);
    }
    out
}

fn delay_for(letter: &str) -> Duration {
    match letter {
        "A" => Duration::from_millis(30),
        "B" => Duration::from_millis(10),
        _ => Duration::from_millis(20),
    }
}

#[tokio::test(start_paused = true)]
async fn gather_restores_scatter_order_despite_completion_order() {
    init_tracing();
    let (in_tx, in_rx) = link::<Tagged<Vec<&'static str>>>();
    let (scattered_tx, scattered_rx) = link();
    let (done_tx, done_rx) = link();
    let (gathered_tx, gathered_rx) = link();

    scatter(in_rx, scattered_tx, |letters: &Vec<&'static str>| letters.clone());
    // Completion order is B, C, A.
    transform(scattered_rx, done_tx, 3, |item: Tagged<&'static str>| async move {
        tokio::time::sleep(delay_for(item.value)).await;
        Some(item.map(|l| l.to_lowercase()))
    });
    gather(done_rx, gathered_tx);

    let root = Tagged::root(vec!["A", "B", "C"]);
    let root_tags = root.tags.clone();
    in_tx.send(root).await.unwrap();
    drop(in_tx);

    let gathered = with_timeout(collect(gathered_rx)).await;
    assert_eq!(gathered.len(), 1);
    assert_eq!(gathered[0].value, vec!["a", "b", "c"]);
    assert_eq!(gathered[0].tags, root_tags, "gather pops the scatter tag");
}

#[tokio::test(start_paused = true)]
async fn gather_keeps_interleaved_groups_apart() {
    let (in_tx, in_rx) = link::<Tagged<u32>>();
    let (scattered_tx, scattered_rx) = link();
    let (done_tx, done_rx) = link();
    let (gathered_tx, gathered_rx) = link();

    scatter(in_rx, scattered_tx, |n: &u32| (0..*n).map(|i| n * 10 + i).collect::<Vec<u32>>());
    transform(scattered_rx, done_tx, 8, |item: Tagged<u32>| async move {
        tokio::time::sleep(Duration::from_millis(u64::from(10 - item.value % 10))).await;
        Some(item)
    });
    gather(done_rx, gathered_tx);

    for n in [3, 2] {
        in_tx.send(Tagged::root(n)).await.unwrap();
    }
    drop(in_tx);

    let mut gathered: Vec<Vec<u32>> = with_timeout(collect(gathered_rx))
        .await
        .into_iter()
        .map(|t| t.value)
        .collect();
    gathered.sort();
    assert_eq!(gathered, vec![vec![20, 21], vec![30, 31, 32]]);
}

#[tokio::test]
async fn scatter_of_nothing_emits_nothing() {
    let (in_tx, in_rx) = link::<Tagged<Vec<u8>>>();
    let (out_tx, out_rx) = link::<Tagged<u8>>();
    scatter(in_rx, out_tx, |v: &Vec<u8>| v.clone());

    in_tx.send(Tagged::root(Vec::new())).await.unwrap();
    drop(in_tx);

    assert!(with_timeout(collect(out_rx)).await.is_empty());
}

#[tokio::test]
async fn broadcast_copies_every_item_and_closes_all_outputs() {
    let (in_tx, in_rx) = link::<u32>();
    let (a_tx, a_rx) = link();
    let (b_tx, b_rx) = link();
    broadcast(in_rx, vec![a_tx, b_tx]);

    let a = tokio::spawn(collect(a_rx));
    let b = tokio::spawn(collect(b_rx));
    for i in 0..4 {
        in_tx.send(i).await.unwrap();
    }
    drop(in_tx);

    assert_eq!(with_timeout(a).await.unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(with_timeout(b).await.unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn ref_counted_channel_closes_after_the_last_producer() {
    let channel = RefCountedChannel::<u32>::new();
    let first = channel.producer();
    let second = channel.producer();
    assert_eq!(channel.producers(), 2);
    let mut rx = channel.into_receiver();

    first.send(1).await.unwrap();
    drop(first);
    assert_eq!(rx.recv().await, Some(1));

    // Still open: the second producer has not finished.
    assert!(rx.try_recv().is_err());
    assert!(!rx.is_closed());

    second.send(2).await.unwrap();
    drop(second);
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(with_timeout(rx.recv()).await, None);
}

#[tokio::test]
async fn connect_with_adapts_values_from_upstream() {
    let channel = RefCountedChannel::<String>::new();
    let (num_tx, num_rx) = link::<u32>();
    channel.connect_with(num_rx, |n| format!("#{n}"));
    let direct = channel.producer();
    let rx = channel.into_receiver();

    num_tx.send(1).await.unwrap();
    direct.send("direct".to_string()).await.unwrap();
    drop(num_tx);
    drop(direct);

    let mut got = with_timeout(collect(rx)).await;
    got.sort();
    assert_eq!(got, vec!["#1", "direct"]);
}

#[tokio::test]
async fn sync_waits_for_matching_items_on_every_input() {
    let (a_in, a_rx) = link::<Tagged<&'static str>>();
    let (b_in, b_rx) = link::<Tagged<&'static str>>();
    let (a_out, a_out_rx) = link();
    let (b_out, b_out_rx) = link();
    sync(vec![a_rx, b_rx], vec![a_out, b_out]);

    let x = Tagged::root("x");
    let y = Tagged::root("y");

    let a_collect = tokio::spawn(collect(a_out_rx));
    let b_collect = tokio::spawn(collect(b_out_rx));

    // Opposite arrival orders on the two inputs.
    a_in.send(x.clone()).await.unwrap();
    a_in.send(y.clone()).await.unwrap();
    b_in.send(y.with_value("y'")).await.unwrap();
    b_in.send(x.with_value("x'")).await.unwrap();
    drop(a_in);
    drop(b_in);

    let a_got = with_timeout(a_collect).await.unwrap();
    let b_got = with_timeout(b_collect).await.unwrap();
    assert_eq!(a_got.len(), 2);
    for (a, b) in a_got.iter().zip(&b_got) {
        assert_eq!(a.tags, b.tags, "outputs are emitted as matched sets");
    }
    let mut a_values: Vec<_> = a_got.iter().map(|t| t.value).collect();
    a_values.sort();
    assert_eq!(a_values, vec!["x", "y"]);
}

#[tokio::test]
async fn sync_pair_matches_items_of_different_types() {
    let (names_in, names_rx) = link::<Tagged<String>>();
    let (sizes_in, sizes_rx) = link::<Tagged<usize>>();
    let (names_out, names_out_rx) = link();
    let (sizes_out, sizes_out_rx) = link();
    sync_pair(names_rx, sizes_rx, names_out, sizes_out);

    let names = tokio::spawn(collect(names_out_rx));
    let sizes = tokio::spawn(collect(sizes_out_rx));

    let item = Tagged::root("ubuntu".to_string());
    sizes_in.send(item.with_value(3)).await.unwrap();
    names_in.send(item).await.unwrap();
    drop(names_in);
    drop(sizes_in);

    let names = with_timeout(names).await.unwrap();
    let sizes = with_timeout(sizes).await.unwrap();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].tags, sizes[0].tags);
    assert_eq!(sizes[0].value, 3);
}

#[tokio::test]
async fn sink_drains_and_counts() {
    let (tx, rx) = link::<u32>();
    let drained = sink(rx);
    for i in 0..5 {
        tx.send(i).await.unwrap();
    }
    drop(tx);
    assert_eq!(with_timeout(drained).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn transform_respects_its_concurrency_limit() {
    let (in_tx, in_rx) = link::<Tagged<u32>>();
    let (out_tx, out_rx) = link::<Tagged<u32>>();
    let gauge = Gauge::new();

    {
        let gauge = Arc::clone(&gauge);
        transform(in_rx, out_tx, 2, move |item: Tagged<u32>| {
            let gauge = Arc::clone(&gauge);
            async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(10)).await;
                gauge.leave();
                // Odd items are dropped.
                (item.value % 2 == 0).then_some(item)
            }
        });
    }

    let collector = tokio::spawn(collect(out_rx));
    for i in 0..6 {
        in_tx.send(Tagged::root(i)).await.unwrap();
    }
    drop(in_tx);

    let mut values: Vec<u32> = with_timeout(collector)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.value)
        .collect();
    values.sort();
    assert_eq!(values, vec![0, 2, 4]);
    assert_eq!(gauge.max(), 2);
}
