//! Primitive catalog: the callable names a policy can grant.
//!
//! Keyword primitives (`print`, `debug`, `eval`) are part of the language
//! and are revoked by disabling the symbol in the parser. Native
//! primitives are host functions registered only when granted.
use crate::config::policy::PermissionList;
use crate::worker::classify::{script_error, Interrupt};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, FLOAT, INT};
use std::cmp::Ordering;

type FnResult<T> = Result<T, Box<EvalAltResult>>;

pub const KEYWORD_PRIMITIVES: &[&str] = &["debug", "eval", "print"];

/// Every primitive the sandbox knows about, sorted.
pub const PRIMITIVE_NAMES: &[&str] = &[
    "bool", "debug", "eval", "exit", "float", "int", "len", "open", "print", "round", "sorted",
    "str", "sum",
];

/// Primitives resolved for one execution.
#[derive(Debug, Clone)]
pub struct PrimitiveTable {
    permitted: Vec<&'static str>,
    disabled: Vec<&'static str>,
}

impl PrimitiveTable {
    pub fn from_policy(builtins: &PermissionList) -> Self {
        if !builtins.is_allow_list() {
            log::warn!("builtin block-list in use; every primitive not named in it stays callable");
        }
        for name in builtins.names() {
            if !PRIMITIVE_NAMES.contains(&name.as_str()) {
                log::debug!("policy names unknown primitive '{name}'");
            }
        }

        let permitted: Vec<&'static str> = PRIMITIVE_NAMES
            .iter()
            .copied()
            .filter(|name| builtins.permits(name))
            .collect();
        let disabled = KEYWORD_PRIMITIVES
            .iter()
            .copied()
            .filter(|name| !permitted.contains(name))
            .collect();
        Self { permitted, disabled }
    }

    /// Names exposed to scripts as `__builtins__`.
    pub fn permitted(&self) -> &[&'static str] {
        &self.permitted
    }

    /// Keyword primitives switched off in the parser.
    pub fn disabled(&self) -> &[&'static str] {
        &self.disabled
    }

    pub fn install(&self, engine: &mut Engine) {
        for name in &self.disabled {
            engine.disable_symbol(*name);
        }
        for name in &self.permitted {
            register(engine, name);
        }
    }
}

fn register(engine: &mut Engine, name: &str) {
    match name {
        "bool" => {
            engine.register_fn("bool", truthy);
        }
        "exit" => {
            engine.register_fn("exit", || -> FnResult<()> { Err(Interrupt::Exit(0).into_error()) });
            engine.register_fn("exit", |status: INT| -> FnResult<()> {
                Err(Interrupt::Exit(status).into_error())
            });
        }
        "float" => {
            engine.register_fn("float", to_float);
        }
        "int" => {
            engine.register_fn("int", to_int);
        }
        "len" => {
            engine.register_fn("len", length);
        }
        "open" => {
            engine.register_fn("open", read_file);
        }
        "round" => {
            engine.register_fn("round", |x: FLOAT| x.round() as INT);
            engine.register_fn("round", |x: INT| x);
            engine.register_fn("round", |x: FLOAT, digits: INT| {
                let scale = 10f64.powi(digits.clamp(-308, 308) as i32);
                (x * scale).round() / scale
            });
        }
        "sorted" => {
            engine.register_fn("sorted", |items: Array| sorted(items, false));
            engine.register_fn("sorted", sorted);
        }
        "str" => {
            engine.register_fn("str", |value: Dynamic| -> ImmutableString {
                value.to_string().into()
            });
        }
        "sum" => {
            engine.register_fn("sum", sum);
        }
        // Keyword primitives need no registration.
        _ => {}
    }
}

fn truthy(value: Dynamic) -> bool {
    if value.is_unit() {
        return false;
    }
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Ok(i) = value.as_int() {
        return i != 0;
    }
    if let Ok(f) = value.as_float() {
        return f != 0.0;
    }
    if value.is_string() {
        return !value.to_string().is_empty();
    }
    if value.is_array() {
        return !value.cast::<Array>().is_empty();
    }
    if value.is_map() {
        return !value.cast::<rhai::Map>().is_empty();
    }
    true
}

fn to_int(value: Dynamic) -> FnResult<INT> {
    if let Ok(i) = value.as_int() {
        return Ok(i);
    }
    if let Ok(f) = value.as_float() {
        if !f.is_finite() {
            return Err(script_error("ValueError", format!("cannot convert float {f} to integer")));
        }
        return Ok(f.trunc() as INT);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(INT::from(b));
    }
    if value.is_string() {
        let text = value.to_string();
        return text.trim().parse::<INT>().map_err(|_| {
            script_error("ValueError", format!("invalid literal for int(): '{text}'"))
        });
    }
    Err(script_error(
        "TypeError",
        format!("int() argument must be a string or a number, not '{}'", value.type_name()),
    ))
}

fn to_float(value: Dynamic) -> FnResult<FLOAT> {
    if let Ok(f) = value.as_float() {
        return Ok(f);
    }
    if let Ok(i) = value.as_int() {
        return Ok(i as FLOAT);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(if b { 1.0 } else { 0.0 });
    }
    if value.is_string() {
        let text = value.to_string();
        return text.trim().parse::<FLOAT>().map_err(|_| {
            script_error("ValueError", format!("could not convert string to float: '{text}'"))
        });
    }
    Err(script_error(
        "TypeError",
        format!("float() argument must be a string or a number, not '{}'", value.type_name()),
    ))
}

fn length(value: Dynamic) -> FnResult<INT> {
    let len = if value.is_string() {
        value.to_string().chars().count()
    } else if value.is_array() {
        value.cast::<Array>().len()
    } else if value.is_map() {
        value.cast::<rhai::Map>().len()
    } else if value.is_blob() {
        value.cast::<rhai::Blob>().len()
    } else {
        return Err(script_error(
            "TypeError",
            format!("object of type '{}' has no len()", value.type_name()),
        ));
    };
    Ok(len as INT)
}

fn read_file(path: ImmutableString) -> FnResult<ImmutableString> {
    std::fs::read_to_string(path.as_str())
        .map(Into::into)
        .map_err(|e| {
            let kind = match e.kind() {
                std::io::ErrorKind::NotFound => "FileNotFoundError",
                std::io::ErrorKind::PermissionDenied => "PermissionError",
                _ => "OSError",
            };
            script_error(kind, format!("{e}: '{path}'"))
        })
}

fn sum(items: Array) -> FnResult<Dynamic> {
    let mut int_total: INT = 0;
    let mut float_total: Option<FLOAT> = None;
    for item in &items {
        if let Ok(i) = item.as_int() {
            match float_total.as_mut() {
                Some(total) => *total += i as FLOAT,
                None => {
                    int_total = int_total
                        .checked_add(i)
                        .ok_or_else(|| script_error("OverflowError", "integer sum overflowed"))?;
                }
            }
        } else if let Ok(f) = item.as_float() {
            *float_total.get_or_insert(int_total as FLOAT) += f;
        } else {
            return Err(script_error(
                "TypeError",
                format!("unsupported operand type for sum(): '{}'", item.type_name()),
            ));
        }
    }
    Ok(match float_total {
        Some(total) => Dynamic::from(total),
        None => Dynamic::from(int_total),
    })
}

/// Sort key shared by every element of an array.
enum SortKeys {
    Numbers(Vec<FLOAT>),
    Strings(Vec<String>),
}

fn sort_keys(items: &Array) -> FnResult<SortKeys> {
    let numbers: Option<Vec<FLOAT>> = items
        .iter()
        .map(|item| {
            item.as_float()
                .ok()
                .or_else(|| item.as_int().ok().map(|i| i as FLOAT))
        })
        .collect();
    if let Some(numbers) = numbers {
        return Ok(SortKeys::Numbers(numbers));
    }
    if items.iter().all(|item| item.is_string() || item.is_char()) {
        return Ok(SortKeys::Strings(items.iter().map(|item| item.to_string()).collect()));
    }
    Err(script_error(
        "TypeError",
        "sorted() requires all numbers or all strings",
    ))
}

fn sorted(items: Array, reverse: bool) -> FnResult<Array> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    match sort_keys(&items)? {
        SortKeys::Numbers(keys) => {
            order.sort_by(|a, b| keys[*a].partial_cmp(&keys[*b]).unwrap_or(Ordering::Equal))
        }
        SortKeys::Strings(keys) => order.sort_by(|a, b| keys[*a].cmp(&keys[*b])),
    }
    if reverse {
        order.reverse();
    }
    Ok(order.into_iter().map(|idx| items[idx].clone()).collect())
}
