// Binding table
//
// Back-reference index between block ports and bus addresses. Owns no
// entities: the bus owns addresses, the scheduler owns instances. At most
// one address per port; fan-out of one address into many inputs is normal,
// two different blocks driving the same address is a configuration error.

use std::collections::HashMap;

use crate::address::{sanitize_scope, AddressKey};
use crate::types::{Direction, Error, Result};

type PortRef = (String, String); // (instance id, port key)

#[derive(Default)]
pub struct BindingTable {
    /// canonical address -> input ports fed by it, in bind order
    inputs_by_addr: HashMap<String, Vec<PortRef>>,
    /// canonical address -> output ports driving it
    outputs_by_addr: HashMap<String, Vec<PortRef>>,
    input_by_port: HashMap<PortRef, AddressKey>,
    output_by_port: HashMap<PortRef, AddressKey>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a port with an address. The caller has already validated
    /// the port against the block schema and made sure the address exists.
    pub fn bind(
        &mut self,
        instance: &str,
        port: &str,
        direction: Direction,
        key: AddressKey,
    ) -> Result<()> {
        let port_ref = (instance.to_string(), port.to_string());
        let canon = key.canonical();
        match direction {
            Direction::Input => {
                if self.input_by_port.contains_key(&port_ref) {
                    return Err(Error::AlreadyBound(format!("{instance}.{port}")));
                }
                self.inputs_by_addr.entry(canon).or_default().push(port_ref.clone());
                self.input_by_port.insert(port_ref, key);
            }
            Direction::Output => {
                if self.output_by_port.contains_key(&port_ref) {
                    return Err(Error::AlreadyBound(format!("{instance}.{port}")));
                }
                if let Some(existing) = self.outputs_by_addr.get(&canon) {
                    if let Some((other, other_port)) =
                        existing.iter().find(|(inst, _)| inst != instance)
                    {
                        return Err(Error::AmbiguousOutput(format!(
                            "{key} is already driven by {other}.{other_port}"
                        )));
                    }
                }
                self.outputs_by_addr.entry(canon).or_default().push(port_ref.clone());
                self.output_by_port.insert(port_ref, key);
            }
        }
        Ok(())
    }

    pub fn unbind(&mut self, instance: &str, port: &str, direction: Direction) -> Result<AddressKey> {
        let port_ref = (instance.to_string(), port.to_string());
        let (by_port, by_addr) = match direction {
            Direction::Input => (&mut self.input_by_port, &mut self.inputs_by_addr),
            Direction::Output => (&mut self.output_by_port, &mut self.outputs_by_addr),
        };
        let key = by_port
            .remove(&port_ref)
            .ok_or_else(|| Error::NotFound(format!("binding {instance}.{port}")))?;
        if let Some(ports) = by_addr.get_mut(&key.canonical()) {
            ports.retain(|p| p != &port_ref);
            if ports.is_empty() {
                by_addr.remove(&key.canonical());
            }
        }
        Ok(key)
    }

    pub fn resolve(&self, instance: &str, port: &str, direction: Direction) -> Option<&AddressKey> {
        let port_ref = (instance.to_string(), port.to_string());
        match direction {
            Direction::Input => self.input_by_port.get(&port_ref),
            Direction::Output => self.output_by_port.get(&port_ref),
        }
    }

    /// All input ports fed by an address, in bind order.
    pub fn subscribers_of(&self, key: &AddressKey) -> Vec<PortRef> {
        self.inputs_by_addr
            .get(&key.canonical())
            .cloned()
            .unwrap_or_default()
    }

    /// The output port driving an address, if any.
    pub fn driver_of(&self, key: &AddressKey) -> Option<&PortRef> {
        self.outputs_by_addr
            .get(&key.canonical())
            .and_then(|v| v.first())
    }

    /// Whether any binding references the address (blocks deletion).
    pub fn references(&self, key: &AddressKey) -> bool {
        let canon = key.canonical();
        self.inputs_by_addr.contains_key(&canon) || self.outputs_by_addr.contains_key(&canon)
    }

    /// Drop every binding of an instance, e.g. when it is deleted.
    pub fn remove_instance(&mut self, instance: &str) {
        self.input_by_port.retain(|(inst, _), _| inst != instance);
        self.output_by_port.retain(|(inst, _), _| inst != instance);
        for map in [&mut self.inputs_by_addr, &mut self.outputs_by_addr] {
            map.retain(|_, ports| {
                ports.retain(|(inst, _)| inst != instance);
                !ports.is_empty()
            });
        }
    }

    /// Bindings of one instance as (port -> address) maps, inputs then outputs.
    pub fn bindings_of(
        &self,
        instance: &str,
    ) -> (
        std::collections::BTreeMap<String, String>,
        std::collections::BTreeMap<String, String>,
    ) {
        let collect = |map: &HashMap<PortRef, AddressKey>| {
            map.iter()
                .filter(|((inst, _), _)| inst == instance)
                .map(|((_, port), key)| (port.clone(), key.to_string()))
                .collect()
        };
        (collect(&self.input_by_port), collect(&self.output_by_port))
    }
}

/// Key of the IKO materialised for a block output, derived deterministically
/// from the instance id: `IKO:<short>_<type>:<port>`. The short number is the
/// second-to-last `_` segment of ids shaped like `<typeid>_<type>_<n>_<hhmmss>`,
/// falling back to the first digit run, then `0`.
pub fn derive_iko_key(instance_id: &str, type_key: &str, port: &str) -> AddressKey {
    let short = short_instance_number(instance_id);
    AddressKey::internal(
        sanitize_scope(&format!("{short}_{type_key}")),
        sanitize_scope(port),
    )
}

fn short_instance_number(instance_id: &str) -> String {
    let parts: Vec<&str> = instance_id.split('_').collect();
    if parts.len() >= 3 {
        let candidate = parts[parts.len() - 2];
        if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
            return candidate.to_string();
        }
    }
    let digits: String = instance_id
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        "0".to_string()
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AddressKey {
        AddressKey::parse(s).unwrap()
    }

    #[test]
    fn test_fan_out_and_subscribers() {
        let mut table = BindingTable::new();
        table.bind("b1", "E1", Direction::Input, key("IKO:0_A:A1")).unwrap();
        table.bind("b2", "E1", Direction::Input, key("iko:0_a:A1")).unwrap();
        let subs = table.subscribers_of(&key("IKO:0_A:A1"));
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0], ("b1".to_string(), "E1".to_string()));
    }

    #[test]
    fn test_already_bound() {
        let mut table = BindingTable::new();
        table.bind("b1", "E1", Direction::Input, key("1/1/1")).unwrap();
        let err = table
            .bind("b1", "E1", Direction::Input, key("1/1/2"))
            .unwrap_err();
        assert_eq!(err.kind(), "already-bound");
        // after unbind the port is free again
        table.unbind("b1", "E1", Direction::Input).unwrap();
        table.bind("b1", "E1", Direction::Input, key("1/1/2")).unwrap();
    }

    #[test]
    fn test_ambiguous_output() {
        let mut table = BindingTable::new();
        table.bind("b1", "A1", Direction::Output, key("1/1/1")).unwrap();
        let err = table
            .bind("b2", "A1", Direction::Output, key("1/1/1"))
            .unwrap_err();
        assert_eq!(err.kind(), "ambiguous-output");
        // the same block may drive it with a second port
        table.bind("b1", "A2", Direction::Output, key("1/1/1")).unwrap();
    }

    #[test]
    fn test_references_and_remove_instance() {
        let mut table = BindingTable::new();
        table.bind("b1", "E1", Direction::Input, key("1/1/1")).unwrap();
        table.bind("b1", "A1", Direction::Output, key("IKO:1_X:A1")).unwrap();
        assert!(table.references(&key("1/1/1")));
        table.remove_instance("b1");
        assert!(!table.references(&key("1/1/1")));
        assert!(!table.references(&key("IKO:1_X:A1")));
    }

    #[test]
    fn test_derive_iko_key() {
        assert_eq!(
            derive_iko_key("20043_Timer_4_153000", "Timer", "A1").to_string(),
            "IKO:4_Timer:A1"
        );
        assert_eq!(
            derive_iko_key("custom-id", "Scale", "A1").to_string(),
            "IKO:0_Scale:A1"
        );
        assert_eq!(
            derive_iko_key("blk7x", "Scale", "A1").to_string(),
            "IKO:7_Scale:A1"
        );
    }
}
