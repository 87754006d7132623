// Logic blocks
//
// A block type declares its input and output ports; an instance is one
// configured occurrence wired to bus addresses. Execution is logically
// synchronous: `execute` runs on the scheduler task and must not block.
// Anything slow belongs in background work that reports back by writing
// an output port on a later tick.

mod builtin;
mod custom;
mod expr;
mod registry;

pub use builtin::{builtin_entries, BuiltinEntry};
pub use custom::{safe_module_name, CustomBlockDef};
pub use expr::Program;
pub use registry::{BlockRegistry, LoadReport};

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Result;
use crate::value::{PortType, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Port and type descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Declaration of a single port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDef {
    /// Human-readable port name
    pub name: String,
    /// Declared data type
    #[serde(rename = "type")]
    pub ty: PortType,
    /// Default for input ports without a delivered value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PortDef {
    pub fn new(name: &str, ty: PortType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: None,
        }
    }

    pub fn with_default(name: &str, ty: PortType, default: Value) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: Some(default),
        }
    }

    /// Value an unset port falls back to.
    pub fn fallback(&self) -> Value {
        self.default.clone().unwrap_or_else(|| self.ty.zero())
    }
}

/// Static description of a block type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Registry key, e.g. `AndGate`
    pub type_key: String,
    /// Stable numeric id
    pub id: u32,
    pub name: String,
    pub category: String,
    pub version: String,
    /// Whether instances persist opt-in state across restarts
    #[serde(default)]
    pub remanent: bool,
    #[serde(default)]
    pub builtin: bool,
    pub inputs: BTreeMap<String, PortDef>,
    pub outputs: BTreeMap<String, PortDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl BlockDescriptor {
    pub fn input(&self, port: &str) -> Option<&PortDef> {
        self.inputs.get(port)
    }

    pub fn output(&self, port: &str) -> Option<&PortDef> {
        self.outputs.get(port)
    }

    pub fn has_port(&self, port: &str, direction: crate::types::Direction) -> bool {
        match direction {
            crate::types::Direction::Input => self.inputs.contains_key(port),
            crate::types::Direction::Output => self.outputs.contains_key(port),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────────────────────────

/// What caused a block execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// An input port received a changed value.
    Input(String),
    /// The instance's periodic interval elapsed.
    Periodic,
    /// First run after load/restore.
    Initial,
    /// Explicit API trigger.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Input(port) => write!(f, "{port}"),
            Trigger::Periodic => write!(f, "periodic"),
            Trigger::Initial => write!(f, "initial"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Context handed to `Block::execute`: current inputs (already coerced, with
/// schema defaults applied), the trigger, and sinks for output writes and
/// debug values. Output writes take effect on the bus after execute returns.
pub struct BlockCtx<'a> {
    pub instance_id: &'a str,
    descriptor: &'a BlockDescriptor,
    inputs: &'a BTreeMap<String, Value>,
    trigger: Trigger,
    outputs: Vec<(String, Value)>,
    debug: Vec<(String, String)>,
    interval: Option<Option<Duration>>,
}

impl<'a> BlockCtx<'a> {
    pub fn new(
        instance_id: &'a str,
        descriptor: &'a BlockDescriptor,
        inputs: &'a BTreeMap<String, Value>,
        trigger: Trigger,
    ) -> Self {
        Self {
            instance_id,
            descriptor,
            inputs,
            trigger,
            outputs: Vec::new(),
            debug: Vec::new(),
            interval: None,
        }
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Current value of an input port, falling back to the schema default.
    pub fn input(&self, port: &str) -> Value {
        if let Some(v) = self.inputs.get(port) {
            if !v.is_null() {
                return v.clone();
            }
        }
        self.descriptor
            .input(port)
            .map(|d| d.fallback())
            .unwrap_or(Value::Null)
    }

    pub fn input_bool(&self, port: &str) -> bool {
        self.input(port).as_bool()
    }

    pub fn input_i64(&self, port: &str) -> i64 {
        self.input(port).as_i64()
    }

    pub fn input_f64(&self, port: &str) -> f64 {
        self.input(port).as_f64()
    }

    pub fn input_string(&self, port: &str) -> String {
        self.input(port).to_wire()
    }

    /// Write an output port. Multiple writes to the same port within one
    /// execution are delivered in order.
    pub fn set_output(&mut self, port: &str, value: Value) {
        self.outputs.push((port.to_string(), value));
    }

    /// Push a key/value pair onto the instance's debug ring.
    pub fn debug(&mut self, key: &str, value: impl fmt::Display) {
        self.debug.push((key.to_string(), value.to_string()));
    }

    /// Request a periodic trigger interval (`None` stops periodic runs).
    pub fn set_interval(&mut self, interval: Option<Duration>) {
        self.interval = Some(interval);
    }

    /// Consume the context into its recorded effects.
    pub fn finish(self) -> ExecutionEffects {
        ExecutionEffects {
            outputs: self.outputs,
            debug: self.debug,
            interval: self.interval,
        }
    }
}

/// What an execution produced, applied by the scheduler afterwards.
pub struct ExecutionEffects {
    pub outputs: Vec<(String, Value)>,
    pub debug: Vec<(String, String)>,
    pub interval: Option<Option<Duration>>,
}

/// A block implementation. One instance per configured occurrence.
pub trait Block: Send + Sync {
    /// Main logic, called on the scheduler task for every trigger.
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()>;

    /// Opt-in state persisted across restarts. Only consulted when the
    /// descriptor is marked remanent.
    fn state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore previously persisted state, called before the first execution.
    fn restore(&mut self, _state: serde_json::Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> BlockDescriptor {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "E1".to_string(),
            PortDef::with_default("Value", PortType::Real, Value::Real(7.5)),
        );
        BlockDescriptor {
            type_key: "Test".into(),
            id: 1,
            name: "Test".into(),
            category: "Test".into(),
            version: "1.0".into(),
            remanent: false,
            builtin: true,
            inputs,
            outputs: BTreeMap::new(),
            help: None,
        }
    }

    #[test]
    fn test_input_falls_back_to_default() {
        let descriptor = descriptor();
        let inputs = BTreeMap::new();
        let ctx = BlockCtx::new("t1", &descriptor, &inputs, Trigger::Initial);
        assert_eq!(ctx.input("E1"), Value::Real(7.5));
        assert_eq!(ctx.input("nope"), Value::Null);
    }

    #[test]
    fn test_outputs_keep_write_order() {
        let descriptor = descriptor();
        let inputs = BTreeMap::new();
        let mut ctx = BlockCtx::new("t1", &descriptor, &inputs, Trigger::Manual);
        ctx.set_output("A1", Value::Bool(true));
        ctx.set_output("A1", Value::Bool(false));
        let effects = ctx.finish();
        assert_eq!(
            effects.outputs,
            vec![
                ("A1".to_string(), Value::Bool(true)),
                ("A1".to_string(), Value::Bool(false)),
            ]
        );
    }
}
