//! Restricted runtime: engine, packages, ceilings, output capture and the
//! variable scope a script starts with.
use crate::config::policy::Policy;
use crate::utils::output::OutputBuffer;
use crate::worker::classify::Interrupt;
use crate::worker::convert::json_to_dynamic;
use crate::worker::imports::ImportGuard;
use crate::worker::limits::CpuBudget;
use crate::worker::primitives::PrimitiveTable;
use rhai::packages::{
    ArithmeticPackage, BasicArrayPackage, BasicIteratorPackage, BasicMapPackage,
    BasicStringPackage, LogicPackage, MoreStringPackage, Package,
};
use rhai::{Array, Dynamic, Engine, Scope};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Names the sandbox binds itself; callers cannot supply them.
pub const RESERVED_NAMES: &[&str] = &["result", "input_data", "__builtins__"];

/// Operations between CPU-time samples.
pub const CPU_SAMPLE_INTERVAL: u64 = 1024;

pub const MAX_MODULES: usize = 64;

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Capture buffers shared with the engine's print/debug callbacks.
#[derive(Clone)]
pub struct CapturedOutput {
    stdout: Rc<RefCell<OutputBuffer>>,
    stderr: Rc<RefCell<OutputBuffer>>,
}

impl CapturedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: Rc::new(RefCell::new(OutputBuffer::new(limit))),
            stderr: Rc::new(RefCell::new(OutputBuffer::new(limit))),
        }
    }

    /// Current stdout and stderr contents.
    pub fn snapshot(&self) -> (String, String) {
        (
            self.stdout.borrow().as_str().to_string(),
            self.stderr.borrow().as_str().to_string(),
        )
    }
}

/// Engine ceilings derived from the memory limit: bytes for strings,
/// elements for arrays, entries for maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCeilings {
    pub string_bytes: usize,
    pub array_items: usize,
    pub map_entries: usize,
}

impl DataCeilings {
    pub fn for_memory(bytes: u64) -> Self {
        let clamp = |n: u64| usize::try_from(n.max(1)).unwrap_or(usize::MAX);
        Self {
            string_bytes: clamp(bytes / 4),
            array_items: clamp(bytes / 64),
            map_entries: clamp(bytes / 128),
        }
    }
}

/// A fully prepared runtime for one execution.
pub struct Namespace {
    pub engine: Engine,
    pub scope: Scope<'static>,
    pub output: CapturedOutput,
    pub primitives: PrimitiveTable,
}

impl Namespace {
    pub fn build(policy: &Policy, input_data: &Map<String, Value>) -> Self {
        let primitives = PrimitiveTable::from_policy(&policy.builtins);
        let output = CapturedOutput::new(policy.max_output_bytes());
        let mut engine = restricted_engine();

        let ceilings = DataCeilings::for_memory(policy.memory_limit_bytes());
        engine
            .set_max_string_size(ceilings.string_bytes)
            .set_max_array_size(ceilings.array_items)
            .set_max_map_size(ceilings.map_entries)
            .set_max_modules(MAX_MODULES)
            .set_fail_on_invalid_map_property(true);

        let budget = CpuBudget::start(policy.cpu_time());
        engine.on_progress(move |ops| {
            if ops % CPU_SAMPLE_INTERVAL == 0 && budget.exhausted() {
                log::debug!("cpu budget exhausted after {ops} operations");
                return Some(Dynamic::from(Interrupt::CpuTimeExceeded));
            }
            None
        });

        let stdout = output.stdout.clone();
        engine.on_print(move |text| stdout.borrow_mut().push_line(text));
        let stderr = output.stderr.clone();
        engine.on_debug(move |text, _source, _pos| stderr.borrow_mut().push_line(text));

        engine.set_module_resolver(ImportGuard::new(policy.imports.clone()));
        primitives.install(&mut engine);

        let scope = bind_scope(&policy.extra_globals, input_data, primitives.permitted());

        Self {
            engine,
            scope,
            output,
            primitives,
        }
    }
}

/// Engine with only the pure language packages: no file, time or math
/// functions until a module is imported.
fn restricted_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.register_global_module(ArithmeticPackage::new().as_shared_module());
    engine.register_global_module(LogicPackage::new().as_shared_module());
    engine.register_global_module(BasicStringPackage::new().as_shared_module());
    engine.register_global_module(MoreStringPackage::new().as_shared_module());
    engine.register_global_module(BasicIteratorPackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());
    engine.register_global_module(BasicMapPackage::new().as_shared_module());
    engine
}

fn push_json(scope: &mut Scope<'static>, name: &str, value: &Value) {
    match json_to_dynamic(value) {
        Ok(value) => {
            scope.push_dynamic(name.to_string(), value);
        }
        Err(e) => log::warn!("global '{name}' not bound: {e}"),
    }
}

/// Scope in precedence order: later pushes shadow earlier ones, so extra
/// globals lose to input keys, and both lose to the reserved names.
fn bind_scope(
    extra_globals: &Map<String, Value>,
    input_data: &Map<String, Value>,
    permitted: &[&str],
) -> Scope<'static> {
    let mut scope = Scope::new();

    for (name, value) in extra_globals {
        if is_reserved(name) {
            log::debug!("dropping reserved extra global '{name}'");
            continue;
        }
        push_json(&mut scope, name, value);
    }

    let mut visible_input = Map::new();
    for (name, value) in input_data {
        if is_reserved(name) {
            log::debug!("dropping reserved input key '{name}'");
            continue;
        }
        push_json(&mut scope, name, value);
        visible_input.insert(name.clone(), value.clone());
    }

    push_json(&mut scope, "input_data", &Value::Object(visible_input));
    let builtins: Array = permitted
        .iter()
        .map(|name| Dynamic::from(name.to_string()))
        .collect();
    scope.push_constant("__builtins__", builtins);
    scope.push("result", ());
    scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn reserved_keys_are_dropped() {
        let input = object(json!({"result": "malicious", "x": 1}));
        let scope = bind_scope(&Map::new(), &input, &["print"]);
        assert!(scope.get_value::<Dynamic>("result").unwrap().is_unit());
        assert_eq!(scope.get_value::<rhai::INT>("x"), Some(1));

        let data = scope.get_value::<rhai::Map>("input_data").unwrap();
        assert!(data.get("result").is_none());
        assert!(data.get("x").is_some());
    }

    #[test]
    fn reserved_extra_globals_are_dropped() {
        let globals = object(json!({"result": 1, "input_data": {"x": 9}, "__builtins__": [], "kept": true}));
        let scope = bind_scope(&globals, &Map::new(), &["print"]);
        assert!(scope.get_value::<Dynamic>("result").unwrap().is_unit());
        assert!(scope.get_value::<rhai::Map>("input_data").unwrap().is_empty());
        assert_eq!(scope.get_value::<Array>("__builtins__").unwrap().len(), 1);
        assert_eq!(scope.get_value::<bool>("kept"), Some(true));
        // Each reserved name is bound exactly once.
        assert_eq!(scope.iter_raw().filter(|(name, ..)| *name == "result").count(), 1);
    }

    #[test]
    fn input_keys_shadow_extra_globals() {
        let globals = object(json!({"limit": 1, "unit": "kg"}));
        let input = object(json!({"limit": 2}));
        let scope = bind_scope(&globals, &input, &[]);
        assert_eq!(scope.get_value::<rhai::INT>("limit"), Some(2));
        assert_eq!(scope.get_value::<String>("unit").as_deref(), Some("kg"));
    }

    #[test]
    fn builtins_list_is_bound() {
        let scope = bind_scope(&Map::new(), &Map::new(), &["len", "print"]);
        let names = scope.get_value::<Array>("__builtins__").unwrap();
        assert_eq!(names.len(), 2);
        assert!(scope.is_constant("__builtins__").unwrap_or(false));
    }

    #[test]
    fn ceilings_scale_with_memory() {
        let small = DataCeilings::for_memory(1024 * 1024);
        let large = DataCeilings::for_memory(256 * 1024 * 1024);
        assert!(small.string_bytes < large.string_bytes);
        assert_eq!(large.string_bytes, 64 * 1024 * 1024);
        assert!(DataCeilings::for_memory(0).array_items >= 1);
    }
}
