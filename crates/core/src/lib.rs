pub mod hashing;
pub mod models;
pub mod rfe;
pub mod validation;

pub use hashing::{chain_hash, compute_sha256_hex, verify_links, ChainBreak, GENESIS};
pub use models::{FormLine, InvoiceForm, InvoiceStatus, RecordKind};
pub use rfe::{convert_to_rfe, Rfe, Totals};
