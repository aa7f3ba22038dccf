//! At-rest representation of records.
//!
//! A record is split into an index part, which always stays in plaintext
//! columns, and a payload part, which is sealed when a cipher is configured.

use serde_json::Value;

use crate::crypto::{Cipher, EncryptedPayload};
use crate::error::{Result, StoreError};
use crate::models::Record;
use crate::schema::Table;

#[derive(Debug, Clone, PartialEq)]
pub enum StoredBody {
    Plain(Record),
    Sealed(EncryptedPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Plaintext index fields, one per column.
    pub index: Record,
    pub body: StoredBody,
}

impl StoredRecord {
    pub fn is_encrypted(&self) -> bool {
        matches!(self.body, StoredBody::Sealed(_))
    }

    pub fn id(&self) -> &str {
        self.index.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    /// Column value for `body`.
    pub fn body_json(&self) -> Result<String> {
        let json = match &self.body {
            StoredBody::Plain(payload) => serde_json::to_string(payload)?,
            StoredBody::Sealed(blob) => serde_json::to_string(blob)?,
        };
        Ok(json)
    }

    pub fn from_columns(index: Record, encrypted: bool, body: &str) -> Result<Self> {
        let body = if encrypted {
            StoredBody::Sealed(serde_json::from_str(body)?)
        } else {
            StoredBody::Plain(serde_json::from_str(body)?)
        };
        Ok(Self { index, body })
    }
}

/// Split `record` into (index part, payload part).
pub fn split_for_encryption(table: Table, record: &Record) -> (Record, Record) {
    let index_fields = table.descriptor().index_fields();
    let mut index = Record::new();
    let mut payload = Record::new();
    for (key, value) in record {
        if index_fields.contains(&key.as_str()) {
            index.insert(key.clone(), value.clone());
        } else {
            payload.insert(key.clone(), value.clone());
        }
    }
    (index, payload)
}

/// Associated data binding a sealed payload to its row.
fn row_context(table: Table, id: &str) -> Vec<u8> {
    format!("{}/{}", table.name(), id).into_bytes()
}

pub fn prepare_record_for_store(
    table: Table,
    record: &Record,
    cipher: Option<&Cipher>,
) -> Result<StoredRecord> {
    let (index, payload) = split_for_encryption(table, record);

    for field in table.descriptor().index_fields() {
        if !matches!(index.get(field), Some(Value::String(_))) {
            return Err(StoreError::Validation(format!(
                "{table} record needs a string '{field}'"
            )));
        }
    }

    let body = match cipher {
        Some(cipher) => {
            let id = index.get("id").and_then(Value::as_str).unwrap_or_default();
            StoredBody::Sealed(
                cipher.encrypt_payload_with_context(&Value::Object(payload), &row_context(table, id))?,
            )
        }
        None => StoredBody::Plain(payload),
    };

    Ok(StoredRecord { index, body })
}

pub fn reconstruct_record_from_store(
    table: Table,
    stored: StoredRecord,
    cipher: Option<&Cipher>,
) -> Result<Record> {
    let StoredRecord { index, body } = stored;
    let id = index.get("id").and_then(Value::as_str).unwrap_or_default();

    let mut record = match body {
        StoredBody::Plain(payload) => payload,
        StoredBody::Sealed(blob) => {
            let cipher = cipher.ok_or_else(|| {
                StoreError::Configuration(format!(
                    "{table} {id} is encrypted; configure encryption before reading"
                ))
            })?;
            match cipher.decrypt_payload_with_context(&blob, &row_context(table, id))? {
                Value::Object(payload) => payload,
                _ => {
                    return Err(StoreError::Decryption(
                        "Decrypted payload is not an object".to_string(),
                    ));
                }
            }
        }
    };
    record.extend(index);
    Ok(record)
}
