// Built-in block types
//
// The compiled-in counterpart of the user module directory: gates,
// comparators, arithmetic, and the stateful helpers (hysteresis, countdown
// timer, daily clock trigger, min/max tracker). Port keys follow the
// E1..En / A1..An convention.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local, Timelike, Utc};
use serde_json::json;

use super::{Block, BlockCtx, BlockDescriptor, PortDef, Trigger};
use crate::types::Result;
use crate::value::{PortType, Value};

pub struct BuiltinEntry {
    pub descriptor: BlockDescriptor,
    pub ctor: fn() -> Box<dyn Block>,
}

/// All compiled-in block types.
pub fn builtin_entries() -> Vec<BuiltinEntry> {
    vec![
        entry(and_gate_descriptor(), || Box::new(AndGate)),
        entry(or_gate_descriptor(), || Box::new(OrGate)),
        entry(not_gate_descriptor(), || Box::new(NotGate)),
        entry(threshold_descriptor(), || Box::new(Threshold)),
        entry(hysteresis_descriptor(), || Box::<Hysteresis>::default()),
        entry(add_descriptor(), || Box::new(Add)),
        entry(multiply_descriptor(), || Box::new(Multiply)),
        entry(switch_descriptor(), || Box::new(Switch)),
        entry(timer_descriptor(), || Box::<Timer>::default()),
        entry(clock_trigger_descriptor(), || Box::<ClockTrigger>::default()),
        entry(min_max_descriptor(), || Box::<MinMax>::default()),
    ]
}

fn entry(descriptor: BlockDescriptor, ctor: fn() -> Box<dyn Block>) -> BuiltinEntry {
    BuiltinEntry { descriptor, ctor }
}

fn ports(defs: Vec<(&str, PortDef)>) -> BTreeMap<String, PortDef> {
    defs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn descriptor(
    type_key: &str,
    id: u32,
    name: &str,
    category: &str,
    inputs: BTreeMap<String, PortDef>,
    outputs: BTreeMap<String, PortDef>,
) -> BlockDescriptor {
    BlockDescriptor {
        type_key: type_key.to_string(),
        id,
        name: name.to_string(),
        category: category.to_string(),
        version: "1.0".to_string(),
        remanent: false,
        builtin: true,
        inputs,
        outputs,
        help: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gates and comparators
// ─────────────────────────────────────────────────────────────────────────────

fn and_gate_descriptor() -> BlockDescriptor {
    descriptor(
        "AndGate",
        10001,
        "AND",
        "Logic",
        ports(vec![
            ("E1", PortDef::with_default("Input 1", PortType::Bool, Value::Bool(false))),
            ("E2", PortDef::with_default("Input 2", PortType::Bool, Value::Bool(false))),
        ]),
        ports(vec![("A1", PortDef::new("Output", PortType::Bool))]),
    )
}

/// Output is 1 only when all inputs are 1.
struct AndGate;

impl Block for AndGate {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        let result = ctx.input_bool("E1") && ctx.input_bool("E2");
        ctx.set_output("A1", Value::Bool(result));
        Ok(())
    }
}

fn or_gate_descriptor() -> BlockDescriptor {
    descriptor(
        "OrGate",
        10002,
        "OR",
        "Logic",
        ports(vec![
            ("E1", PortDef::with_default("Input 1", PortType::Bool, Value::Bool(false))),
            ("E2", PortDef::with_default("Input 2", PortType::Bool, Value::Bool(false))),
        ]),
        ports(vec![("A1", PortDef::new("Output", PortType::Bool))]),
    )
}

struct OrGate;

impl Block for OrGate {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        let result = ctx.input_bool("E1") || ctx.input_bool("E2");
        ctx.set_output("A1", Value::Bool(result));
        Ok(())
    }
}

fn not_gate_descriptor() -> BlockDescriptor {
    descriptor(
        "NotGate",
        10003,
        "NOT",
        "Logic",
        ports(vec![(
            "E1",
            PortDef::with_default("Input", PortType::Bool, Value::Bool(false)),
        )]),
        ports(vec![("A1", PortDef::new("Output", PortType::Bool))]),
    )
}

struct NotGate;

impl Block for NotGate {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        ctx.set_output("A1", Value::Bool(!ctx.input_bool("E1")));
        Ok(())
    }
}

fn threshold_descriptor() -> BlockDescriptor {
    descriptor(
        "Threshold",
        10010,
        "Threshold",
        "Compare",
        ports(vec![
            ("E1", PortDef::with_default("Value", PortType::Real, Value::Real(0.0))),
            ("E2", PortDef::with_default("Threshold", PortType::Real, Value::Real(50.0))),
        ]),
        ports(vec![("A1", PortDef::new("Above threshold", PortType::Bool))]),
    )
}

/// Output is 1 while the value is at or above the threshold.
struct Threshold;

impl Block for Threshold {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        let above = ctx.input_f64("E1") >= ctx.input_f64("E2");
        ctx.set_output("A1", Value::Bool(above));
        Ok(())
    }
}

fn hysteresis_descriptor() -> BlockDescriptor {
    descriptor(
        "Hysteresis",
        10050,
        "Hysteresis",
        "Compare",
        ports(vec![
            ("E1", PortDef::with_default("Value", PortType::Real, Value::Real(0.0))),
            ("E2", PortDef::with_default("Low limit", PortType::Real, Value::Real(20.0))),
            ("E3", PortDef::with_default("High limit", PortType::Real, Value::Real(25.0))),
        ]),
        ports(vec![("A1", PortDef::new("Output", PortType::Bool))]),
    )
}

/// Switches on above the high limit, off below the low limit.
#[derive(Default)]
struct Hysteresis {
    on: bool,
}

impl Block for Hysteresis {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        let value = ctx.input_f64("E1");
        if value >= ctx.input_f64("E3") {
            self.on = true;
        } else if value <= ctx.input_f64("E2") {
            self.on = false;
        }
        ctx.set_output("A1", Value::Bool(self.on));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arithmetic and routing
// ─────────────────────────────────────────────────────────────────────────────

fn add_descriptor() -> BlockDescriptor {
    descriptor(
        "Add",
        10021,
        "Addition",
        "Math",
        ports(vec![
            ("E1", PortDef::with_default("Value 1", PortType::Real, Value::Real(0.0))),
            ("E2", PortDef::with_default("Value 2", PortType::Real, Value::Real(0.0))),
        ]),
        ports(vec![("A1", PortDef::new("Sum", PortType::Real))]),
    )
}

struct Add;

impl Block for Add {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        ctx.set_output("A1", Value::Real(ctx.input_f64("E1") + ctx.input_f64("E2")));
        Ok(())
    }
}

fn multiply_descriptor() -> BlockDescriptor {
    descriptor(
        "Multiply",
        10020,
        "Multiplication",
        "Math",
        ports(vec![
            ("E1", PortDef::with_default("Value", PortType::Real, Value::Real(0.0))),
            ("E2", PortDef::with_default("Factor", PortType::Real, Value::Real(1.0))),
        ]),
        ports(vec![("A1", PortDef::new("Result", PortType::Real))]),
    )
}

struct Multiply;

impl Block for Multiply {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        ctx.set_output("A1", Value::Real(ctx.input_f64("E1") * ctx.input_f64("E2")));
        Ok(())
    }
}

fn switch_descriptor() -> BlockDescriptor {
    descriptor(
        "Switch",
        10040,
        "Selector",
        "Logic",
        ports(vec![
            ("E1", PortDef::with_default("Input A", PortType::Real, Value::Real(0.0))),
            ("E2", PortDef::with_default("Input B", PortType::Real, Value::Real(0.0))),
            ("E3", PortDef::with_default("Select (0=A, 1=B)", PortType::Bool, Value::Bool(false))),
        ]),
        ports(vec![("A1", PortDef::new("Output", PortType::Real))]),
    )
}

/// Routes one of two inputs to the output based on the selector.
struct Switch;

impl Block for Switch {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        let selected = if ctx.input_bool("E3") {
            ctx.input("E2")
        } else {
            ctx.input("E1")
        };
        ctx.set_output("A1", selected);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timer (remanent)
// ─────────────────────────────────────────────────────────────────────────────

fn timer_descriptor() -> BlockDescriptor {
    let mut d = descriptor(
        "Timer",
        20043,
        "Timer",
        "Helpers",
        ports(vec![
            ("E1", PortDef::with_default("Start/Stop (1=start)", PortType::Bool, Value::Bool(false))),
            ("E2", PortDef::with_default("Duration minutes", PortType::Real, Value::Real(0.0))),
        ]),
        ports(vec![
            ("A1", PortDef::new("Running (1=running)", PortType::Bool)),
            ("A2", PortDef::new("Remaining seconds", PortType::Real)),
            ("A3", PortDef::new("Remaining (HH:MM)", PortType::String)),
        ]),
    );
    d.version = "2.1".to_string();
    d.remanent = true;
    d.help = Some(
        "Countdown timer. E2 sets the duration in minutes, a 1 on E1 starts \
         it, a 0 stops it. While running, A2/A3 update every second. The \
         expiry instant survives restarts; elapsed downtime is subtracted \
         on resume."
            .to_string(),
    );
    d
}

/// Countdown timer. The expiry instant is remanent, so a restart resumes the
/// countdown with downtime subtracted, or reports expiry if it passed.
#[derive(Default)]
struct Timer {
    target: Option<DateTime<Utc>>,
    restored: bool,
}

impl Timer {
    fn set_remaining(ctx: &mut BlockCtx, seconds: f64) {
        let seconds = seconds.max(0.0).round();
        ctx.set_output("A2", Value::Real(seconds));
        let s = seconds as i64;
        ctx.set_output("A3", Value::Str(format!("{:02}:{:02}", s / 3600, (s % 3600) / 60)));
    }

    fn stop(&mut self, ctx: &mut BlockCtx, status: &str) {
        self.target = None;
        ctx.set_output("A1", Value::Bool(false));
        Self::set_remaining(ctx, 0.0);
        ctx.set_interval(None);
        ctx.debug("Status", status);
    }

    fn tick(&mut self, ctx: &mut BlockCtx) {
        let Some(target) = self.target else {
            self.stop(ctx, "stopped");
            return;
        };
        let remaining = (target - Utc::now()).num_milliseconds() as f64 / 1000.0;
        if remaining <= 0.0 {
            self.stop(ctx, "expired");
        } else {
            ctx.set_output("A1", Value::Bool(true));
            Self::set_remaining(ctx, remaining);
            ctx.set_interval(Some(Duration::from_secs(1)));
        }
    }
}

impl Block for Timer {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        match ctx.trigger().clone() {
            Trigger::Periodic => self.tick(ctx),
            Trigger::Initial if self.restored => {
                // Resume from the persisted expiry instant rather than
                // re-evaluating the (stale) start input.
                self.restored = false;
                if self.target.is_some() {
                    self.tick(ctx);
                    ctx.debug("Status", "resumed after restart");
                } else {
                    self.stop(ctx, "expired during restart");
                }
            }
            _ => {
                let minutes = ctx.input_f64("E2");
                if ctx.input_bool("E1") && minutes > 0.0 {
                    let seconds = minutes * 60.0;
                    self.target =
                        Some(Utc::now() + chrono::Duration::milliseconds((seconds * 1000.0) as i64));
                    ctx.set_output("A1", Value::Bool(true));
                    Self::set_remaining(ctx, seconds);
                    ctx.set_interval(Some(Duration::from_secs(1)));
                    ctx.debug("Status", format!("running, {minutes} min"));
                } else {
                    self.stop(ctx, "stopped");
                }
            }
        }
        Ok(())
    }

    fn state(&self) -> Option<serde_json::Value> {
        Some(match self.target {
            Some(target) => json!({
                "running": true,
                "target_unix": target.timestamp(),
                "saved_at": Utc::now().timestamp(),
            }),
            None => json!({ "running": false }),
        })
    }

    fn restore(&mut self, state: serde_json::Value) {
        self.restored = true;
        if state.get("running").and_then(|v| v.as_bool()) == Some(true) {
            self.target = state
                .get("target_unix")
                .and_then(|v| v.as_i64())
                .and_then(|ts| DateTime::from_timestamp(ts, 0));
            // Expired while we were down: the initial run reports it.
            if let Some(target) = self.target {
                if target <= Utc::now() {
                    self.target = None;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clock trigger
// ─────────────────────────────────────────────────────────────────────────────

fn clock_trigger_descriptor() -> BlockDescriptor {
    descriptor(
        "ClockTrigger",
        20041,
        "Clock trigger",
        "Helpers",
        ports(vec![
            ("E1", PortDef::with_default("Enable", PortType::Bool, Value::Bool(false))),
            ("E2", PortDef::with_default("Time of day (HH:MM)", PortType::String, Value::Str(String::new()))),
        ]),
        ports(vec![("A1", PortDef::new("Pulse", PortType::Bool))]),
    )
}

/// Emits a 1-then-0 pulse on A1 once per day at the configured local time.
struct ClockTrigger {
    last_fired_minute: i32,
}

impl Default for ClockTrigger {
    fn default() -> Self {
        Self { last_fired_minute: -1 }
    }
}

impl Block for ClockTrigger {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        if !ctx.input_bool("E1") {
            ctx.set_interval(None);
            ctx.set_output("A1", Value::Bool(false));
            return Ok(());
        }
        ctx.set_interval(Some(Duration::from_secs(1)));

        if *ctx.trigger() == Trigger::Periodic {
            let target = ctx.input_string("E2");
            let now = Local::now();
            let current = now.format("%H:%M").to_string();
            let minute_of_day = (now.hour() * 60 + now.minute()) as i32;
            if !target.is_empty() && current == target && minute_of_day != self.last_fired_minute {
                self.last_fired_minute = minute_of_day;
                ctx.set_output("A1", Value::Bool(true));
                ctx.set_output("A1", Value::Bool(false));
                ctx.debug("Status", format!("fired at {current}"));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Min/Max tracker (remanent)
// ─────────────────────────────────────────────────────────────────────────────

fn min_max_descriptor() -> BlockDescriptor {
    let mut d = descriptor(
        "MinMax",
        20045,
        "Min/Max",
        "Helpers",
        ports(vec![
            ("E1", PortDef::with_default("Value", PortType::Real, Value::Real(0.0))),
            ("E2", PortDef::with_default("Reset (1=reset)", PortType::Bool, Value::Bool(false))),
        ]),
        ports(vec![
            ("A1", PortDef::new("Current value", PortType::Real)),
            ("A2", PortDef::new("Minimum", PortType::Real)),
            ("A3", PortDef::new("Maximum", PortType::Real)),
            ("A4", PortDef::new("Minimum time (HH:MM)", PortType::String)),
            ("A5", PortDef::new("Maximum time (HH:MM)", PortType::String)),
        ]),
    );
    d.remanent = true;
    d
}

/// Tracks the minimum and maximum of an input with local timestamps.
#[derive(Default)]
struct MinMax {
    min: Option<f64>,
    max: Option<f64>,
    min_time: String,
    max_time: String,
}

impl MinMax {
    fn send_extremes(&self, ctx: &mut BlockCtx) {
        ctx.set_output("A2", Value::Real(self.min.unwrap_or(0.0)));
        ctx.set_output("A3", Value::Real(self.max.unwrap_or(0.0)));
        ctx.set_output("A4", Value::Str(self.min_time.clone()));
        ctx.set_output("A5", Value::Str(self.max_time.clone()));
    }
}

impl Block for MinMax {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        if *ctx.trigger() == Trigger::Initial {
            if self.min.is_some() {
                self.send_extremes(ctx);
            }
            return Ok(());
        }

        if ctx.input_bool("E2") {
            *self = MinMax::default();
            ctx.set_output("A1", Value::Real(0.0));
            self.send_extremes(ctx);
            ctx.debug("Status", "reset");
            return Ok(());
        }

        let value = ctx.input_f64("E1");
        let now = Local::now().format("%H:%M").to_string();
        ctx.set_output("A1", Value::Real(value));

        if self.min.map_or(true, |m| value < m) {
            self.min = Some(value);
            self.min_time = now.clone();
        }
        if self.max.map_or(true, |m| value > m) {
            self.max = Some(value);
            self.max_time = now;
        }
        self.send_extremes(ctx);
        Ok(())
    }

    fn state(&self) -> Option<serde_json::Value> {
        self.min.map(|min| {
            json!({
                "min": min,
                "max": self.max,
                "min_t": self.min_time,
                "max_t": self.max_time,
            })
        })
    }

    fn restore(&mut self, state: serde_json::Value) {
        self.min = state.get("min").and_then(|v| v.as_f64());
        self.max = state.get("max").and_then(|v| v.as_f64());
        self.min_time = state
            .get("min_t")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.max_time = state
            .get("max_t")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(block: &mut dyn Block, descriptor: &BlockDescriptor, inputs: Vec<(&str, Value)>, trigger: Trigger) -> Vec<(String, Value)> {
        let inputs: BTreeMap<String, Value> =
            inputs.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let mut ctx = BlockCtx::new("test", descriptor, &inputs, trigger);
        block.execute(&mut ctx).unwrap();
        ctx.finish().outputs
    }

    fn last_output(outputs: &[(String, Value)], port: &str) -> Value {
        outputs
            .iter()
            .rev()
            .find(|(k, _)| k == port)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    }

    #[test]
    fn test_not_gate_inverts() {
        let d = not_gate_descriptor();
        let mut gate = NotGate;
        let out = run(&mut gate, &d, vec![("E1", Value::Bool(true))], Trigger::Input("E1".into()));
        assert_eq!(last_output(&out, "A1"), Value::Bool(false));
        let out = run(&mut gate, &d, vec![("E1", Value::Int(0))], Trigger::Input("E1".into()));
        assert_eq!(last_output(&out, "A1"), Value::Bool(true));
    }

    #[test]
    fn test_hysteresis_band() {
        let d = hysteresis_descriptor();
        let mut block = Hysteresis::default();
        let t = Trigger::Input("E1".into());
        let out = run(&mut block, &d, vec![("E1", Value::Real(26.0))], t.clone());
        assert_eq!(last_output(&out, "A1"), Value::Bool(true));
        // inside the band the state holds
        let out = run(&mut block, &d, vec![("E1", Value::Real(22.0))], t.clone());
        assert_eq!(last_output(&out, "A1"), Value::Bool(true));
        let out = run(&mut block, &d, vec![("E1", Value::Real(19.0))], t);
        assert_eq!(last_output(&out, "A1"), Value::Bool(false));
    }

    #[test]
    fn test_timer_start_and_remanence() {
        let d = timer_descriptor();
        let mut timer = Timer::default();
        let out = run(
            &mut timer,
            &d,
            vec![("E1", Value::Bool(true)), ("E2", Value::Real(5.0))],
            Trigger::Input("E1".into()),
        );
        assert_eq!(last_output(&out, "A1"), Value::Bool(true));
        assert_eq!(last_output(&out, "A2"), Value::Real(300.0));
        assert_eq!(last_output(&out, "A3"), Value::Str("00:05".into()));

        // round-trip the remanent state into a fresh instance
        let state = timer.state().unwrap();
        let mut resumed = Timer::default();
        resumed.restore(state);
        let out = run(&mut resumed, &d, vec![], Trigger::Initial);
        assert_eq!(last_output(&out, "A1"), Value::Bool(true));
        assert!(last_output(&out, "A2").as_f64() > 295.0);
    }

    #[test]
    fn test_timer_expired_during_restart() {
        let mut timer = Timer::default();
        timer.restore(json!({"running": true, "target_unix": Utc::now().timestamp() - 60}));
        let d = timer_descriptor();
        let out = run(&mut timer, &d, vec![], Trigger::Initial);
        assert_eq!(last_output(&out, "A1"), Value::Bool(false));
        assert_eq!(last_output(&out, "A2"), Value::Real(0.0));
    }

    #[test]
    fn test_min_max_tracks_and_resets() {
        let d = min_max_descriptor();
        let mut block = MinMax::default();
        let t = Trigger::Input("E1".into());
        run(&mut block, &d, vec![("E1", Value::Real(21.0))], t.clone());
        run(&mut block, &d, vec![("E1", Value::Real(18.5))], t.clone());
        let out = run(&mut block, &d, vec![("E1", Value::Real(25.0))], t.clone());
        assert_eq!(last_output(&out, "A2"), Value::Real(18.5));
        assert_eq!(last_output(&out, "A3"), Value::Real(25.0));

        let out = run(&mut block, &d, vec![("E2", Value::Bool(true))], Trigger::Input("E2".into()));
        assert_eq!(last_output(&out, "A2"), Value::Real(0.0));
        assert!(block.state().is_none());
    }
}
