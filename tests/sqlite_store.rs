#![cfg(feature = "store-sqlite")]

mod common;

use std::sync::Arc;

use bitcoin::{hashes::Hash, BlockHash, OutPoint};
use cedazo::{
    store::{InputRow, NewBlock, OutputRow},
    ChunkCoordinator, DedupeCache, SqliteStore, Store, Topic,
};
use common::{address, block, foreign_outpoint, header, script, tx, MemNode, RecordingSink};
use tempfile::TempDir;

fn open() -> anyhow::Result<(TempDir, SqliteStore)> {
    // temp dir: WAL mode puts side files next to the database
    let dir = tempfile::tempdir()?;
    let store = SqliteStore::new(dir.path().join("cedazo.db"))?;
    Ok((dir, store))
}

#[tokio::test]
async fn tracked_addresses_follow_accounts_and_denylist() -> anyhow::Result<()> {
    let (_dir, store) = open()?;

    let live = store.add_account("exchange", true).await?;
    let paused = store.add_account("archived", false).await?;
    store.track_address(&address(1)).await?;
    store.add_account_address(live, &address(2)).await?;
    store.add_account_address(paused, &address(3)).await?;
    store.track_address(&address(4)).await?;
    store.deny_address(&address(4)).await?;

    let asked: Vec<String> = (1..=5).map(address).collect();
    let mut found = store.find_tracked_addresses(&asked).await?;
    found.sort_by(|a, b| a.address.cmp(&b.address));

    let mut expected = vec![(address(1), None), (address(2), Some(live))];
    expected.sort();
    let found: Vec<_> = found.into_iter().map(|t| (t.address, t.account_id)).collect();
    assert_eq!(found, expected);
    Ok(())
}

#[tokio::test]
async fn many_addresses_are_looked_up_in_chunks() -> anyhow::Result<()> {
    let (_dir, store) = open()?;
    store.track_address(&address(7)).await?;

    let mut asked: Vec<String> = (0..1_200).map(|i| format!("bcrt1qunknown{i}")).collect();
    asked.push(address(7));

    let found = store.find_tracked_addresses(&asked).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address, address(7));
    Ok(())
}

#[tokio::test]
async fn blocks_link_to_parents_and_upsert_by_hash() -> anyhow::Result<()> {
    let (_dir, store) = open()?;
    let b1 = block(BlockHash::all_zeros(), 1, vec![tx(&[], &[], 1)]);
    let b2 = block(b1.block_hash(), 2, vec![tx(&[], &[], 2)]);

    assert!(store.get_block_by_hash(b1.block_hash()).await?.is_none());

    let id1 = store
        .add_block(NewBlock {
            height: 1,
            hash: b1.block_hash(),
            time: 1,
            parent_id: None,
        })
        .await?;
    let id2 = store
        .add_block(NewBlock {
            height: 2,
            hash: b2.block_hash(),
            time: 2,
            parent_id: Some(id1),
        })
        .await?;
    assert_ne!(id1, id2);

    let stored = store.get_block_by_hash(b2.block_hash()).await?.expect("registered");
    assert_eq!((stored.id, stored.height), (id2, 2));

    // registering the same hash again keeps its id
    let again = store
        .add_block(NewBlock {
            height: 2,
            hash: b2.block_hash(),
            time: 2,
            parent_id: Some(id1),
        })
        .await?;
    assert_eq!(again, id2);
    Ok(())
}

#[tokio::test]
async fn saved_outputs_become_known_outpoints_and_confirm() -> anyhow::Result<()> {
    let (_dir, store) = open()?;
    let funding = tx(&[], &[script(1), script(2)], 1);
    let fid = funding.compute_txid();

    store
        .save_outputs(&[OutputRow {
            txid: fid,
            vout: 1,
            address: address(2),
            value: 50_000,
            account_id: None,
        }])
        .await?;

    let asked = [OutPoint::new(fid, 0), OutPoint::new(fid, 1), foreign_outpoint(3)];
    let known = store.find_known_outpoints(&asked).await?;
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].outpoint, OutPoint::new(fid, 1));
    assert_eq!(known[0].address, address(2));

    let spender = tx(&[OutPoint::new(fid, 1)], &[script(9)], 2);
    store
        .save_inputs(&[InputRow {
            txid: spender.compute_txid(),
            vin: 0,
            prevout: OutPoint::new(fid, 1),
            address: address(2),
        }])
        .await?;

    // seen but not yet in a block
    assert_eq!(store.transaction_block(fid).await?, None);

    let b = block(BlockHash::all_zeros(), 1, vec![funding, spender.clone()]);
    let block_id = store
        .add_block(NewBlock {
            height: 1,
            hash: b.block_hash(),
            time: 1,
            parent_id: None,
        })
        .await?;
    store
        .confirm_transactions(&[fid, spender.compute_txid()], block_id)
        .await?;

    assert_eq!(store.transaction_block(fid).await?, Some(block_id));
    assert_eq!(
        store.transaction_block(spender.compute_txid()).await?,
        Some(block_id)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunk_runs_end_to_end_on_sqlite() -> anyhow::Result<()> {
    common::init();
    let (_dir, store) = open()?;
    store.track_address(&address(1)).await?;
    let store = Arc::new(store);

    let pay = tx(&[], &[script(1)], 1);
    let spend = tx(&[OutPoint::new(pay.compute_txid(), 0)], &[script(9)], 2);
    let b1 = block(BlockHash::all_zeros(), 1, vec![pay.clone()]);
    let b2 = block(b1.block_hash(), 2, vec![spend.clone(), tx(&[], &[script(8)], 3)]);

    let node = Arc::new(MemNode::default());
    node.add(&b1);
    node.add(&b2);
    let sink = Arc::new(RecordingSink::default());

    let coordinator = ChunkCoordinator::initialize(
        &common::config(2),
        Arc::clone(&store),
        node,
        Arc::clone(&sink),
        Arc::new(DedupeCache::default()),
    );
    let report = coordinator
        .process_chunk(vec![header(&b1, 1), header(&b2, 2)])
        .await?;

    assert!(report.rescan.is_empty());
    let id1 = report.blocks[0].id.expect("registered");
    let id2 = report.blocks[1].id.expect("registered");
    assert_eq!(store.transaction_block(pay.compute_txid()).await?, Some(id1));
    assert_eq!(store.transaction_block(spend.compute_txid()).await?, Some(id2));

    let parent = store.get_block_by_hash(b1.block_hash()).await?.expect("stored");
    assert_eq!(parent.id, id1);
    assert_eq!(sink.on(Topic::Transaction).len(), 2);
    assert_eq!(sink.on(Topic::Block).len(), 2);
    Ok(())
}
