use super::{AccessPointClient, DeliveryReceipt, Submission};
use anyhow::Result;
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Accepts every submission after a short simulated latency.
#[derive(Clone, Default)]
pub struct MockClient {
    latency: Duration,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(200),
        })
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self { latency })
    }
}

#[async_trait]
impl AccessPointClient for MockClient {
    async fn submit(&self, submission: &Submission) -> Result<DeliveryReceipt> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        // simulate network latency
        sleep(self.latency).await;
        tracing::debug!(invoice_id=%submission.invoice_id, transmission_id=%id, "mock delivery accepted");
        Ok(DeliveryReceipt::accepted(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billchain_core::{convert_to_rfe, InvoiceForm, RecordKind, GENESIS};

    #[tokio::test]
    async fn mock_accepts_with_transmission_id() {
        let client = MockClient::with_latency(Duration::ZERO);
        let submission = Submission {
            user_id: "u1".into(),
            invoice_id: "INV-1".into(),
            record: convert_to_rfe(&InvoiceForm::default(), RecordKind::Alta, "INV-1"),
            prev_hash: GENESIS.into(),
            hash: "abc".into(),
        };
        let receipt = client.submit(&submission).await.unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.transmission_id.unwrap().len(), 16);
    }
}
