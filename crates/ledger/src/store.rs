use crate::error::{LedgerError, Result};
use billchain_core::{chain_hash, verify_links, ChainBreak, InvoiceStatus, RecordKind, Rfe, GENESIS};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;

const CHAIN_TREE: &str = "chain_state";
const INVOICES_TREE: &str = "invoices";
const QUEUE_TREE: &str = "delivery_queue";

/// Per-user head of the hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub last_hash: String,
    pub length: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChainState {
    pub fn genesis() -> Self {
        Self {
            last_hash: GENESIS.to_string(),
            length: 0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRecord {
    pub id: String,
    pub user_id: String,
    pub position: u64,
    pub record: Rfe,
    pub prev_hash: String,
    pub hash: String,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub transmission_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub user_id: String,
    pub invoice_id: String,
    pub position: u64,
    pub status: InvoiceStatus,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Result of re-walking a user's stored chain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub user_id: String,
    pub length: u64,
    pub last_hash: String,
    pub valid: bool,
    pub broken_at: Option<ChainBreak>,
}

/// A new link to append. `requires` names an ALTA invoice id of the same
/// user that must already be chained (cancellations).
pub(crate) struct NewLink<'a> {
    pub user_id: &'a str,
    pub invoice_id: &'a str,
    pub record: &'a Rfe,
    pub requires: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Document store for chain heads, chained invoices and the delivery outbox.
#[derive(Clone)]
pub struct LedgerStore {
    db: Db,
    chain: Tree,
    invoices: Tree,
    queue: Tree,
}

fn scoped_key(user_id: &str, id: &str) -> String {
    format!("{user_id}/{id}")
}

fn user_prefix(user_id: &str) -> String {
    format!("{user_id}/")
}

fn queue_key(user_id: &str, position: u64) -> String {
    // zero padded so byte order == enqueue order
    format!("{user_id}/{position:020}")
}

fn encode<T: Serialize>(value: &T) -> ConflictableTransactionResult<Vec<u8>, LedgerError> {
    serde_json::to_vec(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> ConflictableTransactionResult<T, LedgerError> {
    serde_json::from_slice(raw).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn abort<T>(err: LedgerError) -> ConflictableTransactionResult<T, LedgerError> {
    Err(ConflictableTransactionError::Abort(err))
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            chain: db.open_tree(CHAIN_TREE)?,
            invoices: db.open_tree(INVOICES_TREE)?,
            queue: db.open_tree(QUEUE_TREE)?,
            db,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn chain_state(&self, user_id: &str) -> Result<ChainState> {
        match self.chain.get(user_id.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(ChainState::genesis()),
        }
    }

    pub fn invoice(&self, user_id: &str, invoice_id: &str) -> Result<Option<InvoiceRecord>> {
        match self.invoices.get(scoped_key(user_id, invoice_id).as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// All invoices of a user in chain order.
    pub fn invoices(&self, user_id: &str) -> Result<Vec<InvoiceRecord>> {
        let mut out = Vec::new();
        for item in self.invoices.scan_prefix(user_prefix(user_id).as_bytes()) {
            let (_k, v) = item?;
            let rec: InvoiceRecord = serde_json::from_slice(&v)?;
            out.push(rec);
        }
        out.sort_by_key(|r| r.position);
        Ok(out)
    }

    /// Pending queue entries of a user, oldest first.
    pub fn pending(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        let mut out = Vec::new();
        for item in self.queue.scan_prefix(user_prefix(user_id).as_bytes()) {
            let (_k, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    pub fn users_with_pending(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = Vec::new();
        for item in self.queue.iter() {
            let (k, _v) = item?;
            let key = String::from_utf8_lossy(&k);
            if let Some((user, _)) = key.split_once('/') {
                if users.last().map(String::as_str) != Some(user) {
                    users.push(user.to_string());
                }
            }
        }
        Ok(users)
    }

    /// Chain a record: reads the head, rejects duplicates, writes the
    /// invoice, its queue entry and the new head in one transaction.
    pub(crate) fn append(&self, link: NewLink<'_>) -> Result<InvoiceRecord> {
        let invoice_key = scoped_key(link.user_id, link.invoice_id);

        let record = (&self.chain, &self.invoices, &self.queue).transaction(
            |(chain, invoices, queue)| {
                let state = match chain.get(link.user_id.as_bytes())? {
                    Some(raw) => decode::<ChainState>(&raw)?,
                    None => ChainState::genesis(),
                };

                if invoices.get(invoice_key.as_bytes())?.is_some() {
                    return abort(LedgerError::DuplicateInvoice(link.invoice_id.to_string()));
                }
                if let Some(target) = link.requires {
                    let Some(raw) = invoices.get(scoped_key(link.user_id, target).as_bytes())? else {
                        return abort(LedgerError::UnknownInvoice(target.to_string()));
                    };
                    let existing: InvoiceRecord = decode(&raw)?;
                    if existing.record.kind != RecordKind::Alta {
                        return abort(LedgerError::NotCancellable(target.to_string()));
                    }
                }

                let hash = chain_hash(link.record, &state.last_hash)
                    .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

                let record = InvoiceRecord {
                    id: link.invoice_id.to_string(),
                    user_id: link.user_id.to_string(),
                    position: state.length,
                    record: link.record.clone(),
                    prev_hash: state.last_hash.clone(),
                    hash: hash.clone(),
                    status: InvoiceStatus::Pending,
                    created_at: link.now,
                    sent_at: None,
                    transmission_id: None,
                };
                let entry = QueueEntry {
                    user_id: link.user_id.to_string(),
                    invoice_id: link.invoice_id.to_string(),
                    position: state.length,
                    status: InvoiceStatus::Pending,
                    enqueued_at: link.now,
                    attempts: 0,
                    last_error: None,
                    last_attempt_at: None,
                };
                let head = ChainState {
                    last_hash: hash,
                    length: state.length + 1,
                    updated_at: Some(link.now),
                };

                invoices.insert(invoice_key.as_bytes(), encode(&record)?)?;
                queue.insert(queue_key(link.user_id, state.length).as_bytes(), encode(&entry)?)?;
                chain.insert(link.user_id.as_bytes(), encode(&head)?)?;
                Ok(record)
            },
        )?;

        Ok(record)
    }

    /// Delivery succeeded: drop the queue entry and mark the invoice sent.
    pub(crate) fn mark_sent(
        &self,
        entry: &QueueEntry,
        transmission_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<InvoiceRecord> {
        let invoice_key = scoped_key(&entry.user_id, &entry.invoice_id);
        let entry_key = queue_key(&entry.user_id, entry.position);

        let record = (&self.invoices, &self.queue).transaction(|(invoices, queue)| {
            let Some(raw) = invoices.get(invoice_key.as_bytes())? else {
                return abort(LedgerError::MissingRecord(entry.invoice_id.clone()));
            };
            let mut record: InvoiceRecord = decode(&raw)?;
            record.status = InvoiceStatus::Sent;
            record.sent_at = Some(now);
            record.transmission_id = transmission_id.clone();

            invoices.insert(invoice_key.as_bytes(), encode(&record)?)?;
            queue.remove(entry_key.as_bytes())?;
            Ok(record)
        })?;

        Ok(record)
    }

    /// Delivery failed: the entry stays queued with its attempt recorded.
    pub(crate) fn record_failure(&self, entry: &QueueEntry, error: &str, now: DateTime<Utc>) -> Result<()> {
        update_entry(&self.queue, &queue_key(&entry.user_id, entry.position), |e| {
            e.attempts += 1;
            e.last_error = Some(error.to_string());
            e.last_attempt_at = Some(now);
        })
    }

    pub fn verify_chain(&self, user_id: &str) -> Result<ChainReport> {
        let records = self.invoices(user_id)?;
        let state = self.chain_state(user_id)?;

        let mut broken_at = verify_links(
            records
                .iter()
                .map(|r| (&r.record, r.prev_hash.as_str(), r.hash.as_str())),
        )
        .err();

        if broken_at.is_none() {
            let tail = records.last().map(|r| r.hash.as_str()).unwrap_or(GENESIS);
            if tail != state.last_hash || records.len() as u64 != state.length {
                broken_at = Some(ChainBreak {
                    position: records.len(),
                    reason: format!(
                        "chain head {} (length {}) does not match stored tail {} (length {})",
                        state.last_hash,
                        state.length,
                        tail,
                        records.len()
                    ),
                });
            }
        }

        Ok(ChainReport {
            user_id: user_id.to_string(),
            length: state.length,
            last_hash: state.last_hash,
            valid: broken_at.is_none(),
            broken_at,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn update_entry<F>(tree: &Tree, key: &str, mut f: F) -> Result<()>
where
    F: FnMut(&mut QueueEntry),
{
    let existing = tree
        .get(key.as_bytes())?
        .ok_or_else(|| LedgerError::MissingRecord(key.to_string()))?;
    let mut entry: QueueEntry = serde_json::from_slice(&existing)?;
    f(&mut entry);
    tree.insert(key.as_bytes(), serde_json::to_vec(&entry)?)?;
    Ok(())
}
