use crate::audit::{AuditEvent, AuditLog};
use crate::error::Result;
use crate::store::{LedgerStore, QueueEntry};
use access_point::{AccessPointClient, DeliveryReceipt, Submission};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HaltedDelivery {
    pub invoice_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub user_id: String,
    pub delivered: Vec<String>,
    pub halted: Option<HaltedDelivery>,
    /// Entries still queued after this drain.
    pub remaining: usize,
}

impl DrainReport {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            delivered: Vec::new(),
            halted: None,
            remaining: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.halted.is_none()
    }
}

/// Drives a user's delivery queue in chain order, halting at the first failure.
#[derive(Clone)]
pub struct QueueProcessor {
    store: LedgerStore,
    client: Arc<dyn AccessPointClient + 'static>,
    audit: AuditLog,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl QueueProcessor {
    pub fn new(
        store: LedgerStore,
        client: Arc<dyn AccessPointClient + 'static>,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            client,
            audit,
            locks: Arc::default(),
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    /// Forget the user's lock once no drain holds or awaits it.
    fn release_lock(&self, user_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(user_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(user_id);
        }
    }

    pub async fn drain(&self, user_id: &str) -> Result<DrainReport> {
        let lock = self.user_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            self.drain_locked(user_id).await
        };
        drop(lock);
        self.release_lock(user_id);
        result
    }

    async fn drain_locked(&self, user_id: &str) -> Result<DrainReport> {
        let pending = self.store.pending(user_id)?;
        let mut report = DrainReport::new(user_id);

        for (i, entry) in pending.iter().enumerate() {
            match self.deliver(entry).await {
                Ok(receipt) => {
                    let record = match self.store.mark_sent(entry, receipt.transmission_id.clone(), Utc::now()) {
                        Ok(record) => record,
                        Err(err) => {
                            // the authority holds this record; a redrive will submit it again
                            tracing::error!(
                                user_id = %user_id,
                                invoice_id = %entry.invoice_id,
                                transmission_id = ?receipt.transmission_id,
                                error = %err,
                                "accepted delivery could not be recorded"
                            );
                            self.audit.record(
                                AuditEvent::new("delivery_unrecorded", user_id, &entry.invoice_id, "pending")
                                    .with_transmission_id(receipt.transmission_id)
                                    .with_error(err.to_string()),
                            );
                            return Err(err);
                        }
                    };
                    tracing::info!(
                        user_id = %user_id,
                        invoice_id = %entry.invoice_id,
                        transmission_id = ?receipt.transmission_id,
                        "invoice delivered"
                    );
                    self.audit.record(
                        AuditEvent::new("invoice_sent", user_id, &entry.invoice_id, "sent")
                            .with_link(record.prev_hash, record.hash)
                            .with_transmission_id(receipt.transmission_id),
                    );
                    report.delivered.push(entry.invoice_id.clone());
                }
                Err(error) => {
                    self.store.record_failure(entry, &error, Utc::now())?;
                    tracing::warn!(
                        user_id = %user_id,
                        invoice_id = %entry.invoice_id,
                        attempts = entry.attempts + 1,
                        error = %error,
                        "delivery failed, halting queue"
                    );
                    self.audit.record(
                        AuditEvent::new("delivery_failed", user_id, &entry.invoice_id, "pending")
                            .with_error(error.clone()),
                    );
                    report.halted = Some(HaltedDelivery {
                        invoice_id: entry.invoice_id.clone(),
                        error,
                    });
                    report.remaining = pending.len() - i;
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn deliver(&self, entry: &QueueEntry) -> std::result::Result<DeliveryReceipt, String> {
        let record = self
            .store
            .invoice(&entry.user_id, &entry.invoice_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("invoice record {} is missing", entry.invoice_id))?;

        let submission = Submission {
            user_id: record.user_id,
            invoice_id: record.id,
            record: record.record,
            prev_hash: record.prev_hash,
            hash: record.hash,
        };

        match self.client.submit(&submission).await {
            Ok(receipt) if receipt.accepted => Ok(receipt),
            Ok(receipt) => Err(receipt
                .message
                .unwrap_or_else(|| "submission refused".to_string())),
            Err(err) => Err(format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use access_point::mock::MockClient;
    use std::time::Duration;

    fn processor() -> QueueProcessor {
        QueueProcessor::new(LedgerStore::temporary().unwrap(), MockClient::new(), AuditLog::disabled())
    }

    fn tracked(processor: &QueueProcessor) -> Vec<String> {
        let mut users: Vec<String> = processor.locks.lock().unwrap().keys().cloned().collect();
        users.sort();
        users
    }

    #[tokio::test]
    async fn drained_users_do_not_keep_a_lock() {
        let processor = processor();
        for user in ["alice", "bob", "carol"] {
            processor.drain(user).await.unwrap();
        }
        assert!(tracked(&processor).is_empty());
    }

    #[tokio::test]
    async fn lock_survives_while_another_drain_waits() {
        let processor = processor();
        let held = processor.user_lock("alice");
        let guard = held.lock().await;

        let waiting = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.drain("alice").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracked(&processor), vec!["alice"]);

        drop(guard);
        drop(held);
        waiting.await.unwrap().unwrap();
        assert!(tracked(&processor).is_empty());
    }
}
