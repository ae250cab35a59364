use crate::audit::{AuditEvent, AuditLog};
use crate::error::{LedgerError, Result};
use crate::processor::{DrainReport, QueueProcessor};
use crate::store::{ChainReport, InvoiceRecord, LedgerStore, NewLink};
use billchain_core::validation::validate;
use billchain_core::{convert_to_rfe, InvoiceForm, RecordKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated identity of whoever invokes an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub uid: String,
}

impl Caller {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }

    fn is_valid(&self) -> bool {
        !self.uid.is_empty() && !self.uid.contains('/')
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitRequest {
    pub form_data: InvoiceForm,
    #[serde(default)]
    pub tipo: RecordKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfe_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmitResponse {
    fn chained(record: &InvoiceRecord) -> Self {
        Self {
            success: true,
            rfe_id: Some(record.id.clone()),
            hash: Some(record.hash.clone()),
            error: None,
        }
    }

    fn failed(error: &LedgerError) -> Self {
        Self {
            success: false,
            rfe_id: None,
            hash: None,
            error: Some(error.to_string()),
        }
    }
}

/// Emission entrypoint: chain + enqueue atomically, then drive the queue.
#[derive(Clone)]
pub struct Emitter {
    store: LedgerStore,
    processor: QueueProcessor,
    audit: AuditLog,
}

impl Emitter {
    pub fn new(processor: QueueProcessor, audit: AuditLog) -> Self {
        Self {
            store: processor.store().clone(),
            processor,
            audit,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Reports whether the chain write committed. Delivery problems after
    /// the commit are logged and leave the invoice pending.
    pub async fn emit(&self, caller: Option<&Caller>, request: EmitRequest) -> EmitResponse {
        let record = match self.chain_invoice(caller, &request) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, kind = request.tipo.as_str(), "emission rejected");
                return EmitResponse::failed(&err);
            }
        };

        match self.processor.drain(&record.user_id).await {
            Ok(report) if !report.is_clean() => {
                tracing::info!(
                    user_id = %record.user_id,
                    invoice_id = %record.id,
                    remaining = report.remaining,
                    "invoice chained, delivery pending"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(user_id = %record.user_id, error = %err, "queue drain failed");
            }
        }

        EmitResponse::chained(&record)
    }

    /// Step one of emission: validate, convert and append to the caller's chain.
    pub fn chain_invoice(&self, caller: Option<&Caller>, request: &EmitRequest) -> Result<InvoiceRecord> {
        let caller = caller
            .filter(|c| c.is_valid())
            .ok_or(LedgerError::Unauthenticated)?;
        validate(&request.form_data).map_err(LedgerError::InvalidForm)?;

        let now = Utc::now();
        let ids = resolve_ids(&request.form_data, request.tipo, now)?;
        let rfe = convert_to_rfe(&request.form_data, request.tipo, &ids.number);

        let record = self.store.append(NewLink {
            user_id: &caller.uid,
            invoice_id: &ids.invoice_id,
            record: &rfe,
            requires: ids.requires.as_deref(),
            now,
        })?;

        tracing::info!(
            user_id = %caller.uid,
            invoice_id = %record.id,
            position = record.position,
            hash = %record.hash,
            "invoice chained"
        );
        self.audit.record(
            AuditEvent::new("invoice_chained", &caller.uid, &record.id, record.status.as_str())
                .with_link(record.prev_hash.clone(), record.hash.clone()),
        );

        Ok(record)
    }

    /// Explicit re-drive of the caller's delivery queue.
    pub async fn redrive(&self, caller: Option<&Caller>) -> Result<DrainReport> {
        let caller = caller
            .filter(|c| c.is_valid())
            .ok_or(LedgerError::Unauthenticated)?;
        self.processor.drain(&caller.uid).await
    }

    pub fn list(&self, caller: Option<&Caller>) -> Result<Vec<InvoiceRecord>> {
        let caller = caller
            .filter(|c| c.is_valid())
            .ok_or(LedgerError::Unauthenticated)?;
        self.store.invoices(&caller.uid)
    }

    pub fn verify(&self, caller: Option<&Caller>) -> Result<ChainReport> {
        let caller = caller
            .filter(|c| c.is_valid())
            .ok_or(LedgerError::Unauthenticated)?;
        self.store.verify_chain(&caller.uid)
    }
}

#[derive(Debug)]
struct ResolvedIds {
    invoice_id: String,
    number: String,
    requires: Option<String>,
}

/// Id prefixes of non-ALTA records; ALTA numbers may not start with them.
const DERIVED_PREFIXES: [&str; 2] = ["ANULACION-", "EVENTO-"];

fn resolve_ids(form: &InvoiceForm, kind: RecordKind, now: DateTime<Utc>) -> Result<ResolvedIds> {
    let given = form
        .invoice_number
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    match kind {
        RecordKind::Alta => {
            let number = given.unwrap_or_else(|| now.timestamp_millis().to_string());
            if DERIVED_PREFIXES.iter().any(|p| number.starts_with(p)) {
                return Err(LedgerError::InvalidForm(vec![format!(
                    "numeroFactura: {number} uses a prefix reserved for cancellations and events"
                )]));
            }
            Ok(ResolvedIds {
                invoice_id: number.clone(),
                number,
                requires: None,
            })
        }
        RecordKind::Anulacion => {
            let number = given.ok_or_else(|| {
                LedgerError::InvalidForm(vec![
                    "numeroFactura: required to cancel an invoice".to_string()
                ])
            })?;
            Ok(ResolvedIds {
                invoice_id: format!("ANULACION-{number}"),
                requires: Some(number.clone()),
                number,
            })
        }
        RecordKind::Evento => {
            let number = given.unwrap_or_else(|| now.timestamp_millis().to_string());
            Ok(ResolvedIds {
                invoice_id: format!("EVENTO-{number}"),
                number,
                requires: None,
            })
        }
    }
}
