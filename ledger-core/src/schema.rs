//! Structural validation of incoming posting batches
//!
//! Required string fields: `uid`, `type`, `username`, `contract`,
//! `direction`. Required integer fields: `count` (≥ 1), `quantity` (≥ 0).
//! Optional: `note` (string, not null), `timestamp` (numeric epoch micros;
//! a fractional value is truncated). Unknown fields are ignored.

use crate::{types::Posting, Error, Result};
use serde_json::Value;

/// Decode a raw batch into typed postings
pub fn decode_batch(raw: &[Value]) -> Result<Vec<Posting>> {
    if raw.is_empty() {
        tracing::error!("Received empty argument list");
        return Err(Error::Argument("empty batch".to_string()));
    }

    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            decode_posting(value).map_err(|reason| {
                tracing::error!(
                    index,
                    batch = %serde_json::Value::Array(raw.to_vec()),
                    reason = %reason,
                    "Received improperly formatted posting(s)"
                );
                Error::Argument(format!("posting {}: {}", index, reason))
            })
        })
        .collect()
}

/// Check constraints serde cannot express on an already-typed posting
pub fn validate_posting(posting: &Posting) -> std::result::Result<(), String> {
    if posting.count == 0 {
        return Err("count must be at least 1".to_string());
    }
    Ok(())
}

fn decode_posting(value: &Value) -> std::result::Result<Posting, String> {
    let Some(fields) = value.as_object() else {
        return Err("expected an object".to_string());
    };
    let mut fields = fields.clone();

    if fields.get("note").is_some_and(|note| !note.is_string()) {
        return Err("note must be a string".to_string());
    }

    if let Some(timestamp) = fields.get_mut("timestamp") {
        if timestamp.is_f64() {
            let micros = timestamp
                .as_f64()
                .filter(|f| f.is_finite())
                .ok_or_else(|| "timestamp must be finite".to_string())?;
            *timestamp = Value::from(micros.trunc() as i64);
        } else if !timestamp.is_number() {
            return Err("timestamp must be a number".to_string());
        }
    }

    let posting: Posting =
        serde_json::from_value(Value::Object(fields)).map_err(|e| e.to_string())?;
    validate_posting(&posting)?;
    Ok(posting)
}
