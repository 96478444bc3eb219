#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version as BlockVersion},
    consensus,
    hash_types::TxMerkleNode,
    hashes::Hash,
    opcodes::all::OP_RETURN,
    pow::CompactTarget,
    script::Builder,
    transaction::Version,
    Address, Amount, BlockHash, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, WPubkeyHash, Witness,
};
use tokio::sync::Notify;

use cedazo::{
    store::{FundedOutpoint, InputRow, NewBlock, OutputRow, StoredBlock, TrackedAddress},
    BlockHeader, LogFormat, NodeSource, NotificationSink, PipelineConfig, Store, Topic,
};

pub const NET: Network = Network::Regtest;

pub fn init() {
    cedazo::init_logging(LogFormat::Human, "cedazo=debug");
}

pub fn config(workers: usize) -> PipelineConfig {
    PipelineConfig {
        worker_count: workers,
        network: NET,
        ..PipelineConfig::default()
    }
}

/// ------- Minimal in-memory Store -------
#[derive(Default)]
pub struct MemStore {
    tracked: Mutex<HashMap<String, Option<i64>>>,
    denied: Mutex<HashSet<String>>,
    pub blocks: Mutex<Vec<(i64, NewBlock)>>,
    pub outputs: Mutex<Vec<OutputRow>>,
    pub inputs: Mutex<Vec<InputRow>>,
    pub confirmed: Mutex<HashMap<Txid, i64>>,
    pub confirm_calls: Mutex<Vec<usize>>,
    pub address_queries: AtomicUsize,
    pub outpoint_queries: AtomicUsize,
    pub fail_saves: AtomicBool,
    /// While set, `save_outputs` signals `save_held` and parks until `release_saves`.
    pub hold_saves: AtomicBool,
    pub save_held: Notify,
    pub release_saves: Notify,
}

impl MemStore {
    pub fn track(&self, address: &str) {
        self.tracked.lock().unwrap().insert(address.to_string(), None);
    }

    pub fn track_for_account(&self, address: &str, account: i64) {
        self.tracked
            .lock()
            .unwrap()
            .insert(address.to_string(), Some(account));
    }

    pub fn deny(&self, address: &str) {
        self.denied.lock().unwrap().insert(address.to_string());
    }

    /// Pretend an earlier run already stored this output.
    pub fn know_output(&self, outpoint: OutPoint, address: &str) {
        self.outputs.lock().unwrap().push(OutputRow {
            txid: outpoint.txid,
            vout: outpoint.vout,
            address: address.to_string(),
            value: 1_000,
            account_id: None,
        });
    }

    pub fn block_rows(&self) -> Vec<(i64, NewBlock)> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn confirmed_in(&self, txid: &Txid) -> Option<i64> {
        self.confirmed.lock().unwrap().get(txid).copied()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<StoredBlock>> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .iter()
            .find(|(_, b)| b.hash == hash)
            .map(|(id, b)| StoredBlock {
                id: *id,
                height: b.height,
            }))
    }

    async fn add_block(&self, block: NewBlock) -> anyhow::Result<i64> {
        let mut blocks = self.blocks.lock().unwrap();
        let id = blocks.len() as i64 + 1;
        blocks.push((id, block));
        Ok(id)
    }

    async fn find_tracked_addresses(
        &self,
        addresses: &[String],
    ) -> anyhow::Result<Vec<TrackedAddress>> {
        self.address_queries.fetch_add(1, Ordering::SeqCst);
        let tracked = self.tracked.lock().unwrap();
        let denied = self.denied.lock().unwrap();
        Ok(addresses
            .iter()
            .filter(|a| !denied.contains(*a))
            .filter_map(|a| {
                tracked.get(a).map(|account| TrackedAddress {
                    address: a.clone(),
                    account_id: *account,
                })
            })
            .collect())
    }

    async fn find_known_outpoints(
        &self,
        outpoints: &[OutPoint],
    ) -> anyhow::Result<Vec<FundedOutpoint>> {
        self.outpoint_queries.fetch_add(1, Ordering::SeqCst);
        let wanted: HashSet<&OutPoint> = outpoints.iter().collect();
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .iter()
            .map(|row| (OutPoint::new(row.txid, row.vout), row))
            .filter(|(op, _)| wanted.contains(op))
            .map(|(outpoint, row)| FundedOutpoint {
                outpoint,
                address: row.address.clone(),
            })
            .collect())
    }

    async fn save_outputs(&self, rows: &[OutputRow]) -> anyhow::Result<()> {
        if self.hold_saves.load(Ordering::SeqCst) {
            self.save_held.notify_one();
            self.release_saves.notified().await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.outputs.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn save_inputs(&self, rows: &[InputRow]) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.inputs.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn confirm_transactions(&self, ids: &[Txid], block_id: i64) -> anyhow::Result<()> {
        self.confirm_calls.lock().unwrap().push(ids.len());
        let mut confirmed = self.confirmed.lock().unwrap();
        for id in ids {
            confirmed.insert(*id, block_id);
        }
        Ok(())
    }
}

/// ------- Node serving raw blocks from memory -------
#[derive(Default)]
pub struct MemNode {
    blocks: Mutex<HashMap<BlockHash, Vec<u8>>>,
    panic_on: Mutex<HashSet<BlockHash>>,
}

impl MemNode {
    pub fn add(&self, block: &bitcoin::Block) {
        self.blocks
            .lock()
            .unwrap()
            .insert(block.block_hash(), consensus::encode::serialize(block));
    }

    pub fn add_raw(&self, hash: BlockHash, raw: Vec<u8>) {
        self.blocks.lock().unwrap().insert(hash, raw);
    }

    pub fn panic_on(&self, hash: BlockHash) {
        self.panic_on.lock().unwrap().insert(hash);
    }
}

#[async_trait]
impl NodeSource for MemNode {
    async fn get_raw_block(&self, hash: BlockHash) -> anyhow::Result<Vec<u8>> {
        if self.panic_on.lock().unwrap().contains(&hash) {
            panic!("node connection poisoned");
        }
        match self.blocks.lock().unwrap().get(&hash) {
            Some(raw) => Ok(raw.clone()),
            None => anyhow::bail!("unknown block {hash}"),
        }
    }
}

/// ------- Sink recording every publish -------
#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<(Topic, String)>>,
}

impl RecordingSink {
    pub fn on(&self, topic: Topic) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, p)| serde_json::from_str(p).expect("payload is json"))
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, topic: Topic, payload: String) -> anyhow::Result<()> {
        self.published.lock().unwrap().push((topic, payload));
        Ok(())
    }
}

/// ------- Chain fixtures -------

/// P2WPKH script unique to `seed`.
pub fn script(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([seed; 20]))
}

pub fn address(seed: u8) -> String {
    Address::from_script(&script(seed), NET)
        .expect("p2wpkh has an address")
        .to_string()
}

/// Data-carrier output script; has no address.
pub fn op_return() -> ScriptBuf {
    Builder::new().push_opcode(OP_RETURN).into_script()
}

/// An outpoint nobody tracks, unique to `nonce`.
pub fn foreign_outpoint(nonce: u32) -> OutPoint {
    let mut bytes = [0xab; 32];
    bytes[..4].copy_from_slice(&nonce.to_le_bytes());
    OutPoint::new(Txid::from_byte_array(bytes), 0)
}

/// Transaction spending `spends` (or one foreign outpoint) and paying `pays`.
pub fn tx(spends: &[OutPoint], pays: &[ScriptBuf], nonce: u32) -> Transaction {
    let spends = if spends.is_empty() {
        vec![foreign_outpoint(nonce)]
    } else {
        spends.to_vec()
    };
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(nonce),
        input: spends
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: pays
            .iter()
            .map(|s| TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: s.clone(),
            })
            .collect(),
    }
}

pub fn block(prev: BlockHash, time: u32, txdata: Vec<Transaction>) -> bitcoin::Block {
    bitcoin::Block {
        header: Header {
            version: BlockVersion::from_consensus(2),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        },
        txdata,
    }
}

pub fn header(block: &bitcoin::Block, height: u32) -> BlockHeader {
    BlockHeader::from_block(block, height)
}
