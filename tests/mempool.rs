mod common;

use std::sync::{atomic::Ordering, Arc};

use bitcoin::{hashes::Hash, BlockHash, OutPoint};
use cedazo::{
    ChannelSink, ChunkCoordinator, DedupeCache, MempoolProcessor, NotificationSink, Topic,
};
use common::{address, block, header, script, tx, MemNode, MemStore, RecordingSink};

fn processor(
    store: &Arc<MemStore>,
    sink: &Arc<RecordingSink>,
    cache: &Arc<DedupeCache>,
) -> MempoolProcessor<MemStore, RecordingSink> {
    MempoolProcessor::new(
        &common::config(1),
        Arc::clone(store),
        Arc::clone(sink),
        Arc::clone(cache),
    )
}

#[tokio::test]
async fn irrelevant_transactions_are_remembered() -> anyhow::Result<()> {
    common::init();
    let store = Arc::new(MemStore::default());
    store.track(&address(1));
    let sink = Arc::new(RecordingSink::default());
    let cache = Arc::new(DedupeCache::new(64));

    let relevant = tx(&[], &[script(1)], 1);
    let noise = tx(&[], &[script(9)], 2);
    let spender = tx(&[OutPoint::new(relevant.compute_txid(), 0)], &[script(9)], 3);

    let first = processor(&store, &sink, &cache)
        .process(&[noise.clone(), relevant.clone()])
        .await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, relevant.compute_txid());
    assert!(cache.contains(&noise.compute_txid()));
    assert!(!cache.contains(&relevant.compute_txid()));
    assert_eq!(store.outputs.lock().unwrap().len(), 1);

    // the spender is relevant through its input only
    let second = processor(&store, &sink, &cache).process(&[spender.clone()]).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(store.inputs.lock().unwrap().len(), 1);
    assert!(!cache.contains(&spender.compute_txid()));

    let published = sink.on(Topic::Transaction);
    assert_eq!(published.len(), 2);
    assert_eq!(published[1]["id"], spender.compute_txid().to_string());
    assert!(sink.on(Topic::Block).is_empty());
    Ok(())
}

#[tokio::test]
async fn store_failure_caches_nothing() {
    let store = Arc::new(MemStore::default());
    store.track(&address(1));
    store.fail_saves.store(true, Ordering::SeqCst);
    let sink = Arc::new(RecordingSink::default());
    let cache = Arc::new(DedupeCache::new(64));

    let batch = [tx(&[], &[script(9)], 1), tx(&[], &[script(1)], 2)];
    let result = processor(&store, &sink, &cache).process(&batch).await;

    assert!(result.is_err());
    assert!(cache.is_empty());
    assert!(sink.published.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_pass_skips_what_the_mempool_already_cleared() -> anyhow::Result<()> {
    let store = Arc::new(MemStore::default());
    let sink = Arc::new(RecordingSink::default());
    let cache = Arc::new(DedupeCache::new(64));

    // not tracked while it sat in the mempool
    let late = tx(&[], &[script(1)], 1);
    processor(&store, &sink, &cache).process(&[late.clone()]).await?;
    assert!(cache.contains(&late.compute_txid()));

    store.track(&address(1));
    let fresh = tx(&[], &[script(1)], 2);
    let b = block(BlockHash::all_zeros(), 1, vec![late.clone(), fresh.clone()]);
    let node = Arc::new(MemNode::default());
    node.add(&b);

    let coordinator = ChunkCoordinator::initialize(
        &common::config(1),
        Arc::clone(&store),
        node,
        Arc::clone(&sink),
        Arc::clone(&cache),
    );
    let report = coordinator.process_chunk(vec![header(&b, 1)]).await?;

    let ids: Vec<_> = report.broadcast.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![fresh.compute_txid()]);
    Ok(())
}

#[tokio::test]
async fn channel_sink_fans_out_to_subscribers() -> anyhow::Result<()> {
    let sink = ChannelSink::new(8);
    // no subscriber yet: dropped, not an error
    sink.publish(Topic::Block, "{}".to_string()).await?;

    let mut a = sink.subscribe();
    let mut b = sink.subscribe();
    sink.publish(Topic::Transaction, r#"{"id":"00"}"#.to_string())
        .await?;

    for rx in [&mut a, &mut b] {
        let (topic, payload) = rx.recv().await?;
        assert_eq!(topic, Topic::Transaction);
        assert_eq!(topic.to_string(), "transaction");
        assert_eq!(payload, r#"{"id":"00"}"#);
    }
    Ok(())
}
