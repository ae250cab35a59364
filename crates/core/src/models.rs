use serde::{Deserialize, Serialize};

/// Invoice form as submitted by the web client.
///
/// Field names on the wire follow the client's `formData` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceForm {
    #[serde(rename = "numeroFactura", default)]
    pub invoice_number: Option<String>,
    #[serde(rename = "fecha")]
    pub issue_date: String,
    #[serde(rename = "formaPago", default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub iban: Option<String>,
    #[serde(rename = "emisorNombre")]
    pub issuer_name: String,
    #[serde(rename = "emisorNIF")]
    pub issuer_nif: String,
    #[serde(rename = "emisorDomicilio", default)]
    pub issuer_address: Option<String>,
    #[serde(rename = "receptorNombre")]
    pub recipient_name: String,
    #[serde(rename = "receptorNIF")]
    pub recipient_nif: String,
    #[serde(rename = "receptorDomicilio", default)]
    pub recipient_address: Option<String>,
    #[serde(rename = "lineas", default)]
    pub lines: Vec<FormLine>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormLine {
    #[serde(rename = "descripcion", default)]
    pub description: String,
    #[serde(rename = "cantidad")]
    pub quantity: f64,
    #[serde(rename = "precio")]
    pub unit_price: f64,
    /// Percentage, e.g. `21.0` for 21%.
    #[serde(rename = "tipoIVA")]
    pub tax_rate: f64,
}

/// Kind of fiscal record being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    /// Regular invoice registration.
    #[default]
    Alta,
    /// Cancellation of a previously registered invoice.
    Anulacion,
    /// System event record.
    Evento,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Alta => "ALTA",
            RecordKind::Anulacion => "ANULACION",
            RecordKind::Evento => "EVENTO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Sent,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Sent => "sent",
        }
    }
}
