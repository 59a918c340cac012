use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_QR_NAME: &str = "Untitled QR";

pub type Users = BTreeMap<String, User>;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct User {
    #[serde(default, deserialize_with = "lenient_password")]
    pub password: String,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub qr_codes: Vec<QrEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QrEntry {
    pub name: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl QrEntry {
    /// Key used by the gallery page to address this entry in delete requests.
    pub fn key(&self) -> &str {
        match self.id {
            Some(ref id) => id.as_str(),
            None => self.file.rsplit('/').next().unwrap_or(&self.file),
        }
    }
}

// A broken record must not make the whole document unreadable, and one bad
// entry must not take its siblings with it.
fn lenient_entries<'de, D>(deserializer: D) -> Result<Vec<QrEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => items,
        other => {
            warn!("Resetting qr_codes that is not a list: {}", other);
            return Ok(Vec::new());
        }
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Dropping malformed qr_codes entry: {}", err);
                None
            }
        })
        .collect())
}

fn lenient_password<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(password) => Ok(password),
        other => {
            warn!("Treating non-string password {} as empty", other);
            Ok(String::new())
        }
    }
}
