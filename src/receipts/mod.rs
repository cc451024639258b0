//! Durable record of payment attempts.
//!
//! Receipts are kept newest-first and persisted as one JSON array under the
//! [`RECEIPTS_NAMESPACE`] namespace of a [`KeyValueStore`]. Every write merges by
//! signature against the latest persisted snapshot, so a CLI invocation and a
//! background reconciler can share one store. The snapshot decides which receipts
//! exist, so a removal made through one store holds for all of them. On conflict the
//! more advanced status wins: a terminal status is never overwritten by `pending`.
//!
//! Storage failures are logged and otherwise ignored; the in-memory list stays usable.

mod storage;

pub use storage::*;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const RECEIPTS_NAMESPACE: &str = "microapi_transactions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Confirmed,
    Failed,
}

impl ReceiptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReceiptStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Confirmed => "confirmed",
            ReceiptStatus::Failed => "failed",
        }
    }
}

impl Display for ReceiptStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReceiptStatus::Pending),
            "confirmed" => Ok(ReceiptStatus::Confirmed),
            "failed" => Ok(ReceiptStatus::Failed),
            other => Err(format!("unknown receipt status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub signature: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub resource: String,
    pub amount: String,
    pub asset: String,
    pub network: String,
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Predicates for [`ReceiptStore::list`]. All given predicates must match.
#[derive(Debug, Clone, Default)]
pub struct ReceiptFilter {
    pub status: Option<ReceiptStatus>,
    /// Substring of the network name, so `devnet` matches `solana-devnet`.
    pub network: Option<String>,
    /// Case-insensitive substring of the signature or the resource.
    pub text: Option<String>,
}

impl ReceiptFilter {
    pub fn matches(&self, receipt: &Receipt) -> bool {
        let status = self.status.is_none_or(|s| receipt.status == s);
        let network = self
            .network
            .as_deref()
            .is_none_or(|n| receipt.network.contains(n));
        let text = match self.text.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(q) => {
                let q = q.to_lowercase();
                receipt.signature.to_lowercase().contains(&q)
                    || receipt.resource.to_lowercase().contains(&q)
            }
        };
        status && network && text
    }
}

pub struct ReceiptStore {
    backend: Arc<dyn KeyValueStore>,
    state: Mutex<Ledger>,
}

/// In-memory receipts plus the local changes the backend has not accepted yet.
#[derive(Debug, Default)]
struct Ledger {
    receipts: Vec<Receipt>,
    /// Appended here but not yet persisted.
    unsaved: HashSet<String>,
    /// Removed here but not yet persisted.
    removed: HashSet<String>,
}

impl ReceiptStore {
    /// Opens the store and loads the persisted snapshot, if readable.
    pub async fn open(backend: Arc<dyn KeyValueStore>) -> Self {
        let store = Self {
            backend,
            state: Mutex::new(Ledger::default()),
        };
        {
            let mut state = store.state.lock().await;
            store.refresh(&mut state).await;
        }
        store
    }

    /// Inserts `receipt` as the newest entry and persists.
    pub async fn append(&self, receipt: Receipt) {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        state.removed.remove(&receipt.signature);
        state.unsaved.insert(receipt.signature.clone());
        let receipts = &mut state.receipts;
        match receipts.iter().position(|r| r.signature == receipt.signature) {
            Some(index) => {
                let existing = receipts.remove(index);
                receipts.insert(0, prefer_advanced(existing, receipt));
            }
            None => receipts.insert(0, receipt),
        }
        sort_newest_first(receipts);
        self.persist(&mut state).await;
    }

    /// Sets the status of the receipt with `signature`. Unknown signatures are ignored.
    pub async fn update_status(&self, signature: &str, status: ReceiptStatus) {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        let Some(receipt) = state.receipts.iter_mut().find(|r| r.signature == signature) else {
            tracing::debug!(signature, "No receipt to update");
            return;
        };
        if receipt.status == status {
            return;
        }
        receipt.status = status;
        tracing::info!(signature, %status, "Receipt status updated");
        self.persist(&mut state).await;
    }

    /// Receipts matching `filter`, newest first.
    pub async fn list(&self, filter: &ReceiptFilter) -> Vec<Receipt> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        state
            .receipts
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub async fn get(&self, signature: &str) -> Option<Receipt> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        state.receipts.iter().find(|r| r.signature == signature).cloned()
    }

    pub async fn pending(&self) -> Vec<Receipt> {
        self.list(&ReceiptFilter {
            status: Some(ReceiptStatus::Pending),
            ..ReceiptFilter::default()
        })
        .await
    }

    /// Deletes one receipt. Returns whether it existed.
    pub async fn remove(&self, signature: &str) -> bool {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        let before = state.receipts.len();
        state.receipts.retain(|r| r.signature != signature);
        let removed = state.receipts.len() != before;
        if removed {
            state.unsaved.remove(signature);
            state.removed.insert(signature.to_string());
            self.persist(&mut state).await;
        }
        removed
    }

    /// Deletes every receipt.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await;
        let signatures: Vec<String> = state.receipts.drain(..).map(|r| r.signature).collect();
        state.unsaved.clear();
        state.removed.extend(signatures);
        self.persist(&mut state).await;
    }

    /// CSV of the receipts matching `filter`, every field quoted.
    pub async fn export_csv(&self, filter: &ReceiptFilter) -> String {
        to_csv(&self.list(filter).await)
    }

    async fn refresh(&self, state: &mut Ledger) {
        match self.load().await {
            Ok(snapshot) => {
                merge_snapshot(state, snapshot);
                sort_newest_first(&mut state.receipts);
            }
            Err(e) => tracing::warn!(error = %e, "Receipt storage unreadable, using in-memory state"),
        }
    }

    async fn load(&self) -> Result<Vec<Receipt>, StorageError> {
        match self.backend.get(RECEIPTS_NAMESPACE).await? {
            Some(content) if !content.trim().is_empty() => Ok(serde_json::from_str(&content)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn persist(&self, state: &mut Ledger) {
        let result = match serde_json::to_string(&state.receipts) {
            Ok(json) => self.backend.put(RECEIPTS_NAMESPACE, &json).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                state.unsaved.clear();
                state.removed.clear();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to persist receipts"),
        }
    }
}

fn prefer_advanced(current: Receipt, other: Receipt) -> Receipt {
    if other.status.is_terminal() && !current.status.is_terminal() {
        other
    } else if current.status.is_terminal() && !other.status.is_terminal() {
        current
    } else {
        other
    }
}

/// Folds the persisted `snapshot` into the ledger.
///
/// The snapshot decides membership: a receipt it lacks is dropped unless it is a local
/// append that has not been persisted yet, and a receipt removed locally but not yet
/// persisted stays removed. For a signature known to both, the in-memory receipt is kept
/// unless the snapshot has a terminal status and memory does not.
fn merge_snapshot(state: &mut Ledger, snapshot: Vec<Receipt>) {
    let persisted: HashSet<&str> = snapshot.iter().map(|r| r.signature.as_str()).collect();
    let unsaved = &state.unsaved;
    state
        .receipts
        .retain(|r| persisted.contains(r.signature.as_str()) || unsaved.contains(&r.signature));
    let mut index: HashMap<String, usize> = state
        .receipts
        .iter()
        .enumerate()
        .map(|(i, r)| (r.signature.clone(), i))
        .collect();
    for persisted in snapshot {
        if state.removed.contains(&persisted.signature) {
            continue;
        }
        match index.get(&persisted.signature) {
            Some(&i) => {
                if persisted.status.is_terminal() && !state.receipts[i].status.is_terminal() {
                    state.receipts[i] = persisted;
                }
            }
            None => {
                index.insert(persisted.signature.clone(), state.receipts.len());
                state.receipts.push(persisted);
            }
        }
    }
}

fn sort_newest_first(receipts: &mut [Receipt]) {
    receipts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

pub fn iso_timestamp(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

pub fn to_csv(receipts: &[Receipt]) -> String {
    let header = [
        "signature",
        "timestamp",
        "resource",
        "amount",
        "asset",
        "network",
        "status",
    ];
    let mut lines = vec![header.map(csv_field).join(",")];
    for r in receipts {
        let row = [
            r.signature.clone(),
            iso_timestamp(r.timestamp),
            r.resource.clone(),
            r.amount.clone(),
            r.asset.clone(),
            r.network.clone(),
            r.status.to_string(),
        ];
        lines.push(row.iter().map(|v| csv_field(v)).collect::<Vec<_>>().join(","));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(signature: &str, timestamp: u64) -> Receipt {
        Receipt {
            signature: signature.to_string(),
            timestamp,
            resource: format!("https://api.example.com/{signature}"),
            amount: "5000".into(),
            asset: "SOL".into(),
            network: "solana-devnet".into(),
            status: ReceiptStatus::Pending,
            payer: None,
        }
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("quota exceeded".into()))
        }
        async fn put(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("quota exceeded".into()))
        }
    }

    #[tokio::test]
    async fn test_append_is_newest_first() {
        let store = ReceiptStore::open(Arc::new(MemoryStore::new())).await;
        store.append(receipt("a", 1)).await;
        store.append(receipt("b", 2)).await;
        let listed = store.list(&ReceiptFilter::default()).await;
        assert_eq!(listed[0].signature, "b");
        assert_eq!(listed[1].signature, "a");
    }

    #[tokio::test]
    async fn test_update_absent_signature_is_noop() {
        let store = ReceiptStore::open(Arc::new(MemoryStore::new())).await;
        store.append(receipt("a", 1)).await;
        let before = store.list(&ReceiptFilter::default()).await;
        store.update_status("zzz", ReceiptStatus::Confirmed).await;
        assert_eq!(store.list(&ReceiptFilter::default()).await, before);
    }

    #[tokio::test]
    async fn test_filters_and() {
        let store = ReceiptStore::open(Arc::new(MemoryStore::new())).await;
        let mut mainnet = receipt("MainSig", 3);
        mainnet.network = "solana".into();
        store.append(mainnet).await;
        store.append(receipt("DevSig", 2)).await;
        store.update_status("DevSig", ReceiptStatus::Confirmed).await;

        let devnet = store
            .list(&ReceiptFilter {
                network: Some("devnet".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(devnet.len(), 1);

        let confirmed_main = store
            .list(&ReceiptFilter {
                status: Some(ReceiptStatus::Confirmed),
                text: Some("mainsig".into()),
                ..Default::default()
            })
            .await;
        assert!(confirmed_main.is_empty());

        let by_resource = store
            .list(&ReceiptFilter {
                text: Some("API.EXAMPLE.COM/dev".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_resource[0].signature, "DevSig");
    }

    #[tokio::test]
    async fn test_terminal_status_wins_merge() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ui = ReceiptStore::open(Arc::clone(&backend)).await;
        let reconciler = ReceiptStore::open(Arc::clone(&backend)).await;

        ui.append(receipt("a", 1)).await;
        reconciler.update_status("a", ReceiptStatus::Confirmed).await;
        // Re-appending a stale pending copy must not undo confirmation.
        ui.append(receipt("a", 1)).await;
        ui.append(receipt("b", 2)).await;

        let reopened = ReceiptStore::open(backend).await;
        assert_eq!(
            reopened.get("a").await.map(|r| r.status),
            Some(ReceiptStatus::Confirmed)
        );
        assert_eq!(reopened.list(&ReceiptFilter::default()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_removal_holds_across_stores() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cli = ReceiptStore::open(Arc::clone(&backend)).await;
        let reconciler = ReceiptStore::open(Arc::clone(&backend)).await;

        cli.append(receipt("a", 1)).await;
        cli.append(receipt("c", 3)).await;
        assert_eq!(reconciler.list(&ReceiptFilter::default()).await.len(), 2);

        assert!(cli.remove("a").await);
        reconciler.append(receipt("b", 2)).await;
        let listed: Vec<String> = ReceiptStore::open(Arc::clone(&backend))
            .await
            .list(&ReceiptFilter::default())
            .await
            .into_iter()
            .map(|r| r.signature)
            .collect();
        assert_eq!(listed, vec!["c", "b"]);

        cli.clear().await;
        reconciler.update_status("c", ReceiptStatus::Confirmed).await;
        reconciler.append(receipt("d", 4)).await;
        let reopened = ReceiptStore::open(backend).await;
        let listed = reopened.list(&ReceiptFilter::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].signature, "d");
    }

    /// Accepts reads but fails writes until `writable` is set.
    struct FlakyStore {
        inner: MemoryStore,
        writable: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, namespace: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(namespace).await
        }
        async fn put(&self, namespace: &str, value: &str) -> Result<(), StorageError> {
            if self.writable.load(std::sync::atomic::Ordering::SeqCst) {
                self.inner.put(namespace, value).await
            } else {
                Err(StorageError::Unavailable("disk full".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_unsaved_changes_survive_refresh() {
        let backend = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            writable: std::sync::atomic::AtomicBool::new(true),
        });
        let store = ReceiptStore::open(backend.clone()).await;
        store.append(receipt("a", 1)).await;

        backend.writable.store(false, std::sync::atomic::Ordering::SeqCst);
        store.append(receipt("b", 2)).await;
        assert!(store.remove("a").await);
        let listed = store.list(&ReceiptFilter::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].signature, "b");

        backend.writable.store(true, std::sync::atomic::Ordering::SeqCst);
        store.update_status("b", ReceiptStatus::Confirmed).await;
        let reopened = ReceiptStore::open(backend).await;
        let listed = reopened.list(&ReceiptFilter::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ReceiptStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_storage_failure_is_not_fatal() {
        let store = ReceiptStore::open(Arc::new(BrokenStore)).await;
        store.append(receipt("a", 1)).await;
        store.update_status("a", ReceiptStatus::Failed).await;
        assert_eq!(
            store.get("a").await.map(|r| r.status),
            Some(ReceiptStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(dir.path()));
        let store = ReceiptStore::open(Arc::clone(&backend)).await;
        store.append(receipt("a", 1)).await;
        store.append(receipt("b", 2)).await;
        assert!(store.remove("a").await);
        assert!(!store.remove("a").await);
        assert_eq!(ReceiptStore::open(Arc::clone(&backend)).await.pending().await.len(), 1);
        store.clear().await;
        assert!(ReceiptStore::open(backend).await.list(&ReceiptFilter::default()).await.is_empty());
    }

    #[test]
    fn test_csv_quotes_every_field() {
        let mut r = receipt("sig", 1_700_000_000_123);
        r.resource = "https://x/\"quoted\",path".into();
        let csv = to_csv(&[r]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            r#""signature","timestamp","resource","amount","asset","network","status""#
        );
        assert_eq!(
            lines[1],
            r#""sig","2023-11-14T22:13:20.123Z","https://x/""quoted"",path","5000","SOL","solana-devnet","pending""#
        );
    }

    #[test]
    fn test_persisted_layout() {
        let json = serde_json::to_value(receipt("s", 5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "signature": "s",
                "timestamp": 5,
                "resource": "https://api.example.com/s",
                "amount": "5000",
                "asset": "SOL",
                "network": "solana-devnet",
                "status": "pending"
            })
        );
    }
}
