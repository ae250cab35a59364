use crate::models::InvoiceForm;

pub fn party_checks(form: &InvoiceForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    // Invoice number, when given, becomes a storage key segment
    if let Some(number) = form.invoice_number.as_deref() {
        if number.trim().is_empty() {
            errs.push("numeroFactura: must not be blank when provided".to_string());
        } else if number.contains('/') {
            errs.push("numeroFactura: must not contain '/'".to_string());
        }
    }

    if form.issue_date.trim().is_empty() {
        errs.push("fecha: issue date is mandatory".to_string());
    }

    if form.issuer_name.trim().is_empty() {
        errs.push("emisorNombre: issuer name is mandatory".to_string());
    }
    if form.issuer_nif.trim().is_empty() {
        errs.push("emisorNIF: issuer NIF is mandatory".to_string());
    }

    if form.recipient_name.trim().is_empty() {
        errs.push("receptorNombre: recipient name is mandatory".to_string());
    }
    if form.recipient_nif.trim().is_empty() {
        errs.push("receptorNIF: recipient NIF is mandatory".to_string());
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

pub fn line_checks(form: &InvoiceForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    if form.lines.is_empty() {
        errs.push("lineas: at least one line is required".to_string());
        return Err(errs);
    }

    for (i, line) in form.lines.iter().enumerate() {
        if !line.quantity.is_finite() || line.quantity <= 0.0 {
            errs.push(format!("lineas[{i}].cantidad: must be greater than zero"));
        }
        if !line.unit_price.is_finite() || line.unit_price < 0.0 {
            errs.push(format!("lineas[{i}].precio: must not be negative"));
        }
        if !line.tax_rate.is_finite() || !(0.0..=100.0).contains(&line.tax_rate) {
            errs.push(format!("lineas[{i}].tipoIVA: must be between 0 and 100"));
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
