// User block modules
//
// A custom block type is one TOML file in the custom-blocks directory:
// metadata, port schemas, and one expression per output. Files are loaded at
// startup and on explicit reload; a file that fails to parse is skipped with
// a warning and never aborts the scan.
//
//     id = 20050
//     type = "Scale"
//     name = "Scaling"
//     category = "Math"
//
//     [inputs.E1]
//     name = "Value"
//     type = "real"
//     default = 0.0
//
//     [outputs.A1]
//     name = "Result"
//     type = "real"
//     expr = "E1 * 0.5 + 10"

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use super::expr::Program;
use super::{Block, BlockCtx, BlockDescriptor, PortDef};
use crate::types::{Error, Result};
use crate::value::{PortType, Value};

#[derive(Debug, Deserialize)]
struct ModuleFile {
    id: u32,
    #[serde(rename = "type")]
    type_key: String,
    name: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    help: Option<String>,
    /// Periodic re-evaluation interval, if the block wants one.
    #[serde(default)]
    interval_secs: Option<f64>,
    #[serde(default)]
    inputs: BTreeMap<String, InputSpec>,
    outputs: BTreeMap<String, OutputSpec>,
}

fn default_category() -> String {
    "Custom".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Deserialize)]
struct InputSpec {
    name: String,
    #[serde(rename = "type")]
    ty: PortType,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OutputSpec {
    name: String,
    #[serde(rename = "type")]
    ty: PortType,
    expr: String,
}

/// Validate a user-supplied module filename: path and shell metacharacters
/// are stripped, and whatever survives must still be a `*.toml` name or the
/// registry scan would never pick the file up.
pub fn safe_module_name(name: &str) -> Result<String> {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if safe == ".toml" || !safe.ends_with(".toml") {
        return Err(Error::UnknownType(format!(
            "module file name '{name}' (expected *.toml)"
        )));
    }
    Ok(safe)
}

/// A loaded user block type.
#[derive(Debug)]
pub struct CustomBlockDef {
    pub descriptor: BlockDescriptor,
    pub interval_secs: Option<f64>,
    programs: Vec<(String, Program)>,
}

impl CustomBlockDef {
    /// Parse one module file's content.
    pub fn parse(source: &str) -> Result<CustomBlockDef> {
        let module: ModuleFile =
            toml::from_str(source).map_err(|e| Error::UnknownType(format!("module parse: {e}")))?;

        if module.outputs.is_empty() {
            return Err(Error::UnknownType(format!(
                "module '{}' declares no outputs",
                module.type_key
            )));
        }

        let mut programs = Vec::new();
        for (port, spec) in &module.outputs {
            let program = Program::parse(&spec.expr).map_err(|e| {
                Error::UnknownType(format!("module '{}' output {port}: {e}", module.type_key))
            })?;
            programs.push((port.clone(), program));
        }

        let inputs = module
            .inputs
            .into_iter()
            .map(|(key, spec)| {
                (
                    key,
                    PortDef {
                        name: spec.name,
                        ty: spec.ty,
                        default: spec.default,
                    },
                )
            })
            .collect();
        let outputs = module
            .outputs
            .into_iter()
            .map(|(key, spec)| {
                (
                    key,
                    PortDef {
                        name: spec.name,
                        ty: spec.ty,
                        default: None,
                    },
                )
            })
            .collect();

        Ok(CustomBlockDef {
            descriptor: BlockDescriptor {
                type_key: module.type_key,
                id: module.id,
                name: module.name,
                category: module.category,
                version: module.version,
                remanent: false,
                builtin: false,
                inputs,
                outputs,
                help: module.help,
            },
            interval_secs: module.interval_secs,
            programs,
        })
    }

    pub fn load_file(path: &Path) -> Result<CustomBlockDef> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(&source)
    }

    pub fn instantiate(self: &Arc<Self>) -> Box<dyn Block> {
        Box::new(ExprBlock {
            def: Arc::clone(self),
        })
    }
}

/// Runs a custom definition's output expressions over the current inputs.
struct ExprBlock {
    def: Arc<CustomBlockDef>,
}

impl Block for ExprBlock {
    fn execute(&mut self, ctx: &mut BlockCtx) -> Result<()> {
        let vars: BTreeMap<String, Value> = self
            .def
            .descriptor
            .inputs
            .keys()
            .map(|key| (key.clone(), ctx.input(key)))
            .collect();

        if let Some(secs) = self.def.interval_secs {
            ctx.set_interval(Some(std::time::Duration::from_secs_f64(secs.max(0.1))));
        }

        for (port, program) in &self.def.programs {
            let value = program
                .eval(&vars)
                .map_err(|e| Error::BlockExecution(format!("{port} = {}: {e}", program.source())))?;
            ctx.set_output(port, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::Trigger;

    const SCALE: &str = r#"
id = 20050
type = "Scale"
name = "Scaling"
category = "Math"

[inputs.E1]
name = "Value"
type = "real"
default = 0.0

[inputs.E2]
name = "Factor"
type = "real"
default = 2.0

[outputs.A1]
name = "Result"
type = "real"
expr = "E1 * E2"

[outputs.A2]
name = "Above 100"
type = "bool"
expr = "E1 * E2 > 100"
"#;

    #[test]
    fn test_parse_and_execute() {
        let def = Arc::new(CustomBlockDef::parse(SCALE).unwrap());
        assert_eq!(def.descriptor.type_key, "Scale");
        assert_eq!(def.descriptor.inputs.len(), 2);

        let mut block = def.instantiate();
        let inputs: BTreeMap<String, Value> =
            [("E1".to_string(), Value::Real(60.0))].into_iter().collect();
        let mut ctx = BlockCtx::new("c1", &def.descriptor, &inputs, Trigger::Input("E1".into()));
        block.execute(&mut ctx).unwrap();
        let outputs = ctx.finish().outputs;
        assert!(outputs.contains(&("A1".to_string(), Value::Real(120.0))));
        assert!(outputs.contains(&("A2".to_string(), Value::Bool(true))));
    }

    #[test]
    fn test_bad_expression_is_rejected() {
        let bad = SCALE.replace("E1 * E2 > 100", "E1 +");
        assert!(CustomBlockDef::parse(&bad).is_err());
    }

    #[test]
    fn test_no_outputs_is_rejected() {
        let module = "id = 1\ntype = \"X\"\nname = \"X\"\n";
        assert!(CustomBlockDef::parse(module).is_err());
    }

    #[test]
    fn test_safe_module_name() {
        assert_eq!(safe_module_name("scale.toml").unwrap(), "scale.toml");
        assert_eq!(safe_module_name("../../etc/x.toml").unwrap(), "..etcx.toml");
        assert!(safe_module_name("scale.py").is_err());
        assert!(safe_module_name(".toml").is_err());
        assert!(safe_module_name("///").is_err());
        assert!(safe_module_name("").is_err());
    }
}
