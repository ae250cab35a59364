use crate::models::{InvoiceForm, RecordKind};
use serde::{Deserialize, Serialize};

/// Canonical fiscal record derived from an [`InvoiceForm`].
///
/// The field order of these structs is the canonical order used for hashing,
/// so it must not be rearranged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rfe {
    #[serde(rename = "TipoRegistro")]
    pub kind: RecordKind,
    #[serde(rename = "Cabecera")]
    pub header: Header,
    #[serde(rename = "Lineas")]
    pub lines: Vec<RfeLine>,
    #[serde(rename = "Totales")]
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "Factura")]
    pub invoice: InvoiceHeader,
    #[serde(rename = "Emisor")]
    pub issuer: Party,
    #[serde(rename = "Receptor")]
    pub recipient: Party,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceHeader {
    #[serde(rename = "NumeroFactura")]
    pub number: String,
    #[serde(rename = "FechaExpedicion")]
    pub issue_date: String,
    #[serde(rename = "FormaPago")]
    pub payment_method: Option<String>,
    #[serde(rename = "IBAN")]
    pub iban: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    #[serde(rename = "NombreRazon")]
    pub name: String,
    #[serde(rename = "NIF")]
    pub nif: String,
    #[serde(rename = "Domicilio")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfeLine {
    #[serde(rename = "Descripcion")]
    pub description: String,
    #[serde(rename = "Cantidad")]
    pub quantity: f64,
    #[serde(rename = "PrecioUnitario")]
    pub unit_price: f64,
    #[serde(rename = "TipoIVA")]
    pub tax_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(rename = "BaseImponible")]
    pub base: f64,
    #[serde(rename = "CuotaIVA")]
    pub tax: f64,
    #[serde(rename = "ImporteTotal")]
    pub total: f64,
}

impl Totals {
    /// base = Σ qty×price, tax = Σ qty×price×rate/100, rounded to cents.
    pub fn from_lines(lines: &[RfeLine]) -> Self {
        let (base, tax) = lines.iter().fold((0.0_f64, 0.0_f64), |(base, tax), l| {
            let line_base = l.quantity * l.unit_price;
            (base + line_base, tax + line_base * l.tax_rate / 100.0)
        });
        let base = round_cents(base);
        let tax = round_cents(tax);
        Totals {
            base,
            tax,
            total: round_cents(base + tax),
        }
    }
}

fn round_cents(v: f64) -> f64 {
    let r = (v * 100.0).round() / 100.0;
    // avoid "-0.0" leaking into the canonical form
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Convert a form into its canonical record. `number` is the resolved
/// invoice number (the form's own or a generated one).
pub fn convert_to_rfe(form: &InvoiceForm, kind: RecordKind, number: &str) -> Rfe {
    let lines: Vec<RfeLine> = form
        .lines
        .iter()
        .map(|l| RfeLine {
            description: l.description.trim().to_string(),
            quantity: l.quantity,
            unit_price: l.unit_price,
            tax_rate: l.tax_rate,
        })
        .collect();
    let totals = Totals::from_lines(&lines);

    Rfe {
        kind,
        header: Header {
            invoice: InvoiceHeader {
                number: number.to_string(),
                issue_date: form.issue_date.trim().to_string(),
                payment_method: non_empty(&form.payment_method),
                iban: non_empty(&form.iban),
            },
            issuer: Party {
                name: form.issuer_name.trim().to_string(),
                nif: form.issuer_nif.trim().to_string(),
                address: non_empty(&form.issuer_address),
            },
            recipient: Party {
                name: form.recipient_name.trim().to_string(),
                nif: form.recipient_nif.trim().to_string(),
                address: non_empty(&form.recipient_address),
            },
        },
        lines,
        totals,
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::FormLine;

    pub(crate) fn sample_form(number: &str, qty: f64, price: f64, rate: f64) -> InvoiceForm {
        InvoiceForm {
            invoice_number: Some(number.to_string()),
            issue_date: "2025-03-01".to_string(),
            payment_method: Some("transferencia".to_string()),
            iban: Some(" ".to_string()),
            issuer_name: "Acme SL".to_string(),
            issuer_nif: "B12345678".to_string(),
            issuer_address: None,
            recipient_name: "Cliente SA".to_string(),
            recipient_nif: "A87654321".to_string(),
            recipient_address: Some("Calle Mayor 1".to_string()),
            lines: vec![FormLine {
                description: "Consultoria".to_string(),
                quantity: qty,
                unit_price: price,
                tax_rate: rate,
            }],
        }
    }

    #[test]
    fn totals_for_single_line() {
        let rfe = convert_to_rfe(&sample_form("INV-001", 2.0, 50.0, 21.0), RecordKind::Alta, "INV-001");
        assert_eq!(rfe.totals.base, 100.0);
        assert_eq!(rfe.totals.tax, 21.0);
        assert_eq!(rfe.totals.total, 121.0);
    }

    #[test]
    fn totals_sum_mixed_rates() {
        let mut form = sample_form("INV-002", 1.0, 10.0, 21.0);
        form.lines.push(FormLine {
            description: "Libro".to_string(),
            quantity: 3.0,
            unit_price: 5.5,
            tax_rate: 4.0,
        });
        let rfe = convert_to_rfe(&form, RecordKind::Alta, "INV-002");
        assert_eq!(rfe.totals.base, 26.5);
        assert_eq!(rfe.totals.tax, 2.76);
        assert_eq!(rfe.totals.total, 29.26);
    }

    #[test]
    fn blank_optionals_are_dropped() {
        let rfe = convert_to_rfe(&sample_form("INV-003", 1.0, 1.0, 0.0), RecordKind::Alta, "INV-003");
        assert_eq!(rfe.header.invoice.iban, None);
        assert_eq!(rfe.header.issuer.address, None);
        assert_eq!(rfe.header.recipient.address.as_deref(), Some("Calle Mayor 1"));
    }

    #[test]
    fn canonical_shape_uses_fiscal_names() {
        let rfe = convert_to_rfe(&sample_form("INV-004", 1.0, 1.0, 21.0), RecordKind::Anulacion, "INV-004");
        let json = serde_json::to_value(&rfe).unwrap();
        assert_eq!(json["TipoRegistro"], "ANULACION");
        assert_eq!(json["Cabecera"]["Factura"]["NumeroFactura"], "INV-004");
        assert_eq!(json["Cabecera"]["Emisor"]["NIF"], "B12345678");
        assert!(json["Totales"]["ImporteTotal"].is_number());
    }
}
