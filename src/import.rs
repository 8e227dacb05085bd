//! Manual cart entry parsing.
//!
//! One product per line: `product_id[,quantity[,modality]]`. Blank lines
//! and `#` comments are skipped. A bad line is reported with its 1-based
//! line number and never stops the remaining lines from importing.

use serde::Serialize;

use crate::model::{clamp_quantity, AddItemRequest, Modality};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineError {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedImport {
    pub items: Vec<AddItemRequest>,
    pub rejected: Vec<LineError>,
}

/// Outcome of an import handed back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: Vec<LineError>,
}

fn parse_line(line: &str) -> Result<AddItemRequest, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() > 3 {
        return Err(format!("expected at most 3 fields, found {}", fields.len()));
    }

    let product_id = fields[0];
    if product_id.is_empty() {
        return Err("missing product id".to_string());
    }
    if product_id.chars().any(char::is_whitespace) {
        return Err(format!("product id '{product_id}' contains whitespace"));
    }

    let quantity = match fields.get(1).copied().filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse::<i64>()
            .map(clamp_quantity)
            .map_err(|_| format!("quantity '{raw}' is not a whole number"))?,
        None => 1,
    };

    let modality = match fields.get(2).copied().filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse::<Modality>()
            .map_err(|_| format!("modality '{raw}' must be PICKUP or DELIVERY"))?,
        None => Modality::Pickup,
    };

    Ok(AddItemRequest {
        product_id: product_id.to_string(),
        quantity,
        modality,
    })
}

pub fn parse_manual_entries(text: &str) -> ParsedImport {
    let mut parsed = ParsedImport::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(item) => parsed.items.push(item),
            Err(reason) => parsed.rejected.push(LineError {
                line: idx + 1,
                content: line.to_string(),
                reason,
            }),
        }
    }
    parsed
}
