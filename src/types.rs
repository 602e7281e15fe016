use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

fn na() -> String {
    "n/a".to_string()
}

/// `status` RPC result. Only the tip height is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    pub sync_info: SyncInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncInfo {
    pub latest_block_height: u64,
}

/// `block` RPC result: header plus embedded transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    pub header: BlockHeaderInfo,
    #[serde(default)]
    pub transactions: Vec<TransactionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeaderInfo {
    pub hash: String,
    pub height: u64,
    pub prev_hash: String,
    /// Nanoseconds since epoch on the wire.
    pub timestamp: u64,
    pub total_weight: WeightInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightInfo {
    pub num: u64,
}

/// A transaction as embedded in a block. The body is a one-key discriminator
/// map: the key names the transaction kind, the value carries its arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionInfo {
    pub hash: String,
    #[serde(default = "na")]
    pub originator: String,
    #[serde(default)]
    pub body: serde_json::Map<String, Value>,
}

impl BlockHeaderInfo {
    /// Wire timestamps are nanoseconds; rows store milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp / 1_000_000
    }
}

impl TransactionInfo {
    /// Split the body map into its discriminator kind and argument payload.
    pub fn kind_and_args(&self) -> (String, Value) {
        match self.body.iter().next() {
            Some((kind, args)) => (kind.clone(), args.clone()),
            None => (na(), Value::Null),
        }
    }
}

/// Row image of one block plus its derived chunk and transaction rows,
/// as persisted by a single batch transaction.
#[derive(Debug, Clone)]
pub struct BlockRows {
    pub hash: String,
    pub height: u64,
    pub prev_hash: String,
    pub timestamp_ms: u64,
    pub weight: u64,
    pub author_id: String,
    pub list_of_approvals: String,
    pub chunk: ChunkRow,
    pub transactions: Vec<TransactionRow>,
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub hash: String,
    pub block_hash: String,
    pub shard_id: String,
    pub author_id: String,
}

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub hash: String,
    pub originator: String,
    pub destination: String,
    pub kind: String,
    pub args: Value,
    pub chunk_hash: String,
    pub status: String,
    pub logs: String,
}

impl From<&BlockInfo> for BlockRows {
    fn from(block: &BlockInfo) -> Self {
        let block_hash = block.header.hash.clone();
        // The current chain version carries exactly one chunk per block and
        // its hash equals the parent block hash.
        let chunk = ChunkRow {
            hash: block_hash.clone(),
            block_hash: block_hash.clone(),
            shard_id: na(),
            author_id: na(),
        };
        let transactions = block
            .transactions
            .iter()
            .map(|tx| {
                let (kind, args) = tx.kind_and_args();
                TransactionRow {
                    hash: tx.hash.clone(),
                    originator: tx.originator.clone(),
                    destination: na(),
                    kind,
                    args,
                    chunk_hash: block_hash.clone(),
                    status: "Completed".to_string(),
                    logs: na(),
                }
            })
            .collect();
        Self {
            hash: block_hash,
            height: block.header.height,
            prev_hash: block.header.prev_hash.clone(),
            timestamp_ms: block.header.timestamp_ms(),
            weight: block.header.total_weight.num,
            author_id: na(),
            list_of_approvals: na(),
            chunk,
            transactions,
        }
    }
}

/// Telemetry report posted by a validator node.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryReport {
    pub node_id: String,
    #[serde(default = "na")]
    pub account_id: String,
    #[serde(default = "na")]
    pub moniker: String,
    #[serde(default)]
    pub latest_block_height: u64,
}

/// `nodes` row as upserted on every telemetry report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub moniker: String,
    pub account_id: String,
    pub ip_address: String,
    pub last_seen_ms: u64,
    pub last_height: u64,
}

impl NodeRecord {
    pub fn from_report(report: TelemetryReport, ip_address: String, last_seen_ms: u64) -> Self {
        Self {
            node_id: report.node_id,
            moniker: report.moniker,
            account_id: report.account_id,
            ip_address,
            last_seen_ms,
            last_height: report.latest_block_height,
        }
    }
}
