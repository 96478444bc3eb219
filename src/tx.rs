//! Decoded transactions as the prefilter and the notification sink see them.
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Serialize, Serializer};

/// One chain or mempool transaction, reduced to what matching needs.
///
/// Serializes to `{ "id", "inputs": [...], "outputs": [...] }` for the
/// `"transaction"` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedTransaction {
    /// Transaction id.
    pub id: Txid,
    /// Inputs in transaction order.
    pub inputs: Vec<TxInput>,
    /// Outputs in transaction order.
    pub outputs: Vec<TxOutput>,
}

/// The outpoint an input spends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxInput {
    /// Id of the transaction that created the spent output.
    pub txid: Txid,
    /// Index of the spent output.
    pub vout: u32,
}

/// A created output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Output script.
    #[serde(serialize_with = "script_hex")]
    pub script: ScriptBuf,
    /// Canonical address for the script, if the script has one.
    pub address: Option<String>,
}

fn script_hex<S: Serializer>(script: &ScriptBuf, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(script.as_bytes()))
}

impl TxInput {
    /// The spent outpoint.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    /// Coinbase inputs spend nothing.
    pub fn is_coinbase(&self) -> bool {
        self.outpoint().is_null()
    }
}

impl TxOutput {
    /// Build an output, deriving its address on `network`.
    pub fn new(value: u64, script: ScriptBuf, network: Network) -> Self {
        let address = Address::from_script(&script, network)
            .ok()
            .map(|a| a.to_string());
        Self {
            value,
            script,
            address,
        }
    }
}

impl DecodedTransaction {
    /// Reduce a consensus transaction, deriving output addresses on `network`.
    pub fn from_bitcoin(tx: &Transaction, network: Network) -> Self {
        Self {
            id: tx.compute_txid(),
            inputs: tx
                .input
                .iter()
                .map(|i| TxInput {
                    txid: i.previous_output.txid,
                    vout: i.previous_output.vout,
                })
                .collect(),
            outputs: tx
                .output
                .iter()
                .map(|o| TxOutput::new(o.value.to_sat(), o.script_pubkey.clone(), network))
                .collect(),
        }
    }
}
