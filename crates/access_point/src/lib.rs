use anyhow::Result;
use async_trait::async_trait;
use billchain_core::Rfe;
use serde::{Deserialize, Serialize};

/// One chained record handed to the tax authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub user_id: String,
    pub invoice_id: String,
    pub record: Rfe,
    pub prev_hash: String,
    pub hash: String,
}

/// Outcome reported by the authority for a submission it processed.
///
/// A transport or protocol failure is an `Err` from [`AccessPointClient::submit`];
/// a processed-but-refused submission is `accepted: false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub accepted: bool,
    pub transmission_id: Option<String>,
    pub message: Option<String>,
}

impl DeliveryReceipt {
    pub fn accepted(transmission_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            transmission_id: Some(transmission_id.into()),
            message: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            transmission_id: None,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait AccessPointClient: Send + Sync {
    async fn submit(&self, submission: &Submission) -> Result<DeliveryReceipt>;
}

pub mod aeat;
pub mod mock;
