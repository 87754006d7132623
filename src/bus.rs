// Address bus
//
// Canonical store of every address the runtime knows: external group
// addresses and internal IKOs, each with its latest value. All mutation goes
// through the runtime task's command channel, so writes are serialised; the
// map itself is concurrent so the API layer can read without a round trip.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::AddressKey;
use crate::telegram::{Telegram, TelegramBroadcaster, TelegramStatus};
use crate::types::{Error, Origin, Result};
use crate::value::{PortType, Value};
use crate::dpt;

/// A bus address record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub key: AddressKey,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpt: Option<String>,
    pub internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    #[serde(default = "null_value")]
    pub last_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<Value>,
}

fn null_value() -> Value {
    Value::Null
}

/// Everything needed to create an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressDescriptor {
    pub key: AddressKey,
    pub name: String,
    #[serde(default)]
    pub dpt: Option<String>,
    #[serde(default)]
    pub group_label: Option<String>,
    #[serde(default)]
    pub initial_value: Option<Value>,
}

impl AddressDescriptor {
    pub fn new(key: AddressKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            dpt: None,
            group_label: None,
            initial_value: None,
        }
    }

    /// Descriptor for an IKO created on first use.
    pub fn auto(key: &AddressKey) -> Self {
        Self::new(key.clone(), format!("Auto: {key}"))
    }
}

/// Partial update of address metadata. Double options distinguish "leave
/// untouched" (absent) from "clear" (null).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AddressPatch {
    pub name: Option<String>,
    pub dpt: Option<Option<String>>,
    pub group_label: Option<Option<String>>,
    pub initial_value: Option<Option<Value>>,
}

/// Filter for address listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressFilter {
    pub internal: Option<bool>,
    pub group_label: Option<String>,
}

pub struct AddressBus {
    entries: DashMap<String, Address>,
    broadcaster: Arc<TelegramBroadcaster>,
}

impl AddressBus {
    pub fn new(broadcaster: Arc<TelegramBroadcaster>) -> Self {
        Self {
            entries: DashMap::new(),
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<TelegramBroadcaster> {
        &self.broadcaster
    }

    pub fn contains(&self, key: &AddressKey) -> bool {
        self.entries.contains_key(&key.canonical())
    }

    pub fn get(&self, key: &AddressKey) -> Result<Address> {
        self.entries
            .get(&key.canonical())
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub fn list(&self, filter: &AddressFilter) -> Vec<Address> {
        let mut out: Vec<Address> = self
            .entries
            .iter()
            .filter(|e| {
                filter.internal.map_or(true, |i| e.internal == i)
                    && filter
                        .group_label
                        .as_ref()
                        .map_or(true, |g| e.group_label.as_deref() == Some(g.as_str()))
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.key.canonical().cmp(&b.key.canonical()));
        out
    }

    /// Create a new address; `Conflict` if the key already exists
    /// (case-insensitive).
    pub fn create(&self, desc: AddressDescriptor) -> Result<Address> {
        let canon = desc.key.canonical();
        if self.entries.contains_key(&canon) {
            return Err(Error::Conflict(desc.key.to_string()));
        }
        let addr = Address {
            internal: desc.key.is_internal(),
            last_value: desc.initial_value.clone().unwrap_or(Value::Null),
            last_updated: None,
            key: desc.key,
            name: desc.name,
            dpt: desc.dpt,
            group_label: desc.group_label,
            initial_value: desc.initial_value,
        };
        self.entries.insert(canon, addr.clone());
        Ok(addr)
    }

    /// Create-or-return: on key collision the existing entry wins. Idempotent.
    pub fn ensure(&self, desc: AddressDescriptor) -> Address {
        let canon = desc.key.canonical();
        if let Some(existing) = self.entries.get(&canon) {
            return existing.value().clone();
        }
        match self.create(desc) {
            Ok(addr) => addr,
            // create raced an identical key; the existing entry wins
            Err(_) => self.entries.get(&canon).expect("entry exists").value().clone(),
        }
    }

    pub fn update(&self, key: &AddressKey, patch: AddressPatch) -> Result<Address> {
        let mut entry = self
            .entries
            .get_mut(&key.canonical())
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(name) = patch.name {
            entry.name = name;
        }
        if let Some(dpt) = patch.dpt {
            entry.dpt = dpt;
        }
        if let Some(label) = patch.group_label {
            entry.group_label = label;
        }
        if let Some(initial) = patch.initial_value {
            entry.initial_value = initial;
        }
        Ok(entry.clone())
    }

    /// Remove an address record. The caller is responsible for the in-use
    /// check against the binding table before destroying anything.
    pub fn delete(&self, key: &AddressKey) -> Result<Address> {
        self.entries
            .remove(&key.canonical())
            .map(|(_, a)| a)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Seed a record loaded from disk, applying the initial value when no
    /// last value survived.
    pub fn seed(&self, mut addr: Address) {
        if addr.last_value.is_null() {
            if let Some(initial) = addr.initial_value.clone() {
                addr.last_value = initial;
            }
        }
        self.entries.insert(addr.key.canonical(), addr);
    }

    /// Record a value change and publish it. Exactly one telegram per write —
    /// unless the write is a block output carrying the same value as before,
    /// which is suppressed to break trivial cycles (`Ok(None)`).
    ///
    /// Unknown internal addresses are materialised on first write; unknown
    /// external addresses are an error.
    pub fn write(&self, key: &AddressKey, value: Value, origin: Origin) -> Result<Option<Telegram>> {
        let canon = key.canonical();
        if !self.entries.contains_key(&canon) {
            if key.is_internal() {
                debug!(address = %key, "materialising IKO on first write");
                self.ensure(AddressDescriptor::auto(key));
            } else {
                return Err(Error::NotFound(key.to_string()));
            }
        }

        let telegram = {
            let mut entry = self.entries.get_mut(&canon).expect("entry ensured above");
            if let (Some(dpt), false) = (&entry.dpt, entry.internal) {
                // Reject values the declared DPT cannot carry.
                dpt::encode(&value, dpt)?;
            }

            let old = entry.last_value.clone();
            let from_block = matches!(origin, Origin::BlockOut | Origin::IkoInternal);
            if from_block && Value::coerced_eq(&old, &value, PortType::Any) {
                return Ok(None);
            }

            let now = Utc::now();
            // last_updated is monotone per address even if the wall clock is not
            let timestamp = entry.last_updated.map_or(now, |prev| prev.max(now));
            entry.last_value = value.clone();
            entry.last_updated = Some(timestamp);

            Telegram {
                timestamp,
                address: entry.key.to_string(),
                old_value: old,
                new_value: value,
                origin,
                status: TelegramStatus::Ok,
            }
        };

        self.broadcaster.publish(telegram.clone());
        Ok(Some(telegram))
    }

    /// Record a write that the external driver rejected. The stored value is
    /// untouched; subscribers see a failed telegram.
    pub fn record_failure(&self, key: &AddressKey, value: &Value, origin: Origin) {
        let old = self
            .entries
            .get(&key.canonical())
            .map(|e| e.last_value.clone())
            .unwrap_or(Value::Null);
        self.broadcaster.publish(Telegram {
            timestamp: Utc::now(),
            address: key.to_string(),
            old_value: old,
            new_value: value.clone(),
            origin,
            status: TelegramStatus::Failed,
        });
    }

    /// Swap the entire address set, used by backup import.
    pub fn replace_all(&self, addresses: Vec<Address>) {
        self.entries.clear();
        for addr in addresses {
            self.seed(addr);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> AddressBus {
        AddressBus::new(Arc::new(TelegramBroadcaster::new(500)))
    }

    fn key(s: &str) -> AddressKey {
        AddressKey::parse(s).unwrap()
    }

    #[test]
    fn test_create_conflict_case_insensitive() {
        let bus = bus();
        bus.create(AddressDescriptor::new(key("IKO:n1:A1"), "one"))
            .unwrap();
        let err = bus
            .create(AddressDescriptor::new(key("iko:N1:a1"), "two"))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let bus = bus();
        let a = bus.ensure(AddressDescriptor::new(key("1/1/1"), "light"));
        let b = bus.ensure(AddressDescriptor::new(key("1/1/1"), "other name"));
        assert_eq!(a.name, b.name);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_write_emits_telegram_even_when_unchanged() {
        let bus = bus();
        bus.create(AddressDescriptor::new(key("1/1/1"), "light"))
            .unwrap();
        let t1 = bus.write(&key("1/1/1"), Value::Bool(true), Origin::Api).unwrap();
        let t2 = bus.write(&key("1/1/1"), Value::Bool(true), Origin::Api).unwrap();
        assert!(t1.is_some());
        assert!(t2.is_some(), "api writes are never suppressed");
    }

    #[test]
    fn test_block_out_suppression() {
        let bus = bus();
        bus.create(AddressDescriptor::new(key("IKO:n1:A1"), "x"))
            .unwrap();
        assert!(bus
            .write(&key("IKO:n1:A1"), Value::Bool(false), Origin::BlockOut)
            .unwrap()
            .is_some());
        assert!(bus
            .write(&key("IKO:n1:A1"), Value::Bool(false), Origin::BlockOut)
            .unwrap()
            .is_none());
        // coerced comparison: 0 == false
        assert!(bus
            .write(&key("IKO:n1:A1"), Value::Int(0), Origin::BlockOut)
            .unwrap()
            .is_none());
        assert!(bus
            .write(&key("IKO:n1:A1"), Value::Bool(true), Origin::BlockOut)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_write_auto_creates_iko_only() {
        let bus = bus();
        assert!(bus.write(&key("IKO:n9:A1"), Value::Int(1), Origin::Api).is_ok());
        assert!(bus.contains(&key("IKO:n9:A1")));
        let err = bus.write(&key("9/0/0"), Value::Int(1), Origin::Api).unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn test_dpt_rejects_unrepresentable() {
        let bus = bus();
        let mut desc = AddressDescriptor::new(key("2/0/0"), "percent");
        desc.dpt = Some("5".into());
        bus.create(desc).unwrap();
        let err = bus
            .write(&key("2/0/0"), Value::Int(4711), Origin::Api)
            .unwrap_err();
        assert_eq!(err.kind(), "type-coercion");
    }

    #[test]
    fn test_last_updated_monotone() {
        let bus = bus();
        bus.create(AddressDescriptor::new(key("1/1/2"), "x")).unwrap();
        let t1 = bus.write(&key("1/1/2"), Value::Int(1), Origin::Api).unwrap().unwrap();
        let t2 = bus.write(&key("1/1/2"), Value::Int(2), Origin::Api).unwrap().unwrap();
        assert!(t2.timestamp >= t1.timestamp);
    }
}
