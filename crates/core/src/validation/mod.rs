mod rules;

use crate::models::InvoiceForm;

pub fn validate(form: &InvoiceForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    if let Err(mut re) = rules::party_checks(form) {
        errs.append(&mut re);
    }
    if let Err(mut re) = rules::line_checks(form) {
        errs.append(&mut re);
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
