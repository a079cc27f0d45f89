//! Mapping engine failures onto the error taxonomy.
//!
//! Script-visible failures become `"<Kind>: <message>"` strings. Policy
//! interventions (blocked imports, `exit`, CPU budget) travel as an
//! [`Interrupt`] inside `ErrorTerminated`, which scripts cannot catch.
use crate::config::types::ErrorKind;
use rhai::{Dynamic, EvalAltResult, LexError, ParseError, ParseErrorType, Position};

/// Non-catchable stop raised by the sandbox itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    ImportBlocked(String),
    Exit(i64),
    CpuTimeExceeded,
}

impl Interrupt {
    pub fn into_error(self) -> Box<EvalAltResult> {
        EvalAltResult::ErrorTerminated(Dynamic::from(self), Position::NONE).into()
    }
}

/// How an execution ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Ran to completion, or called `exit()` / `exit(0)`.
    Finished,
    Failed(ErrorKind, String),
}

/// Script-raised error with a Python-style kind prefix.
pub fn script_error(kind: &str, message: impl std::fmt::Display) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(format!("{kind}: {message}").into(), Position::NONE).into()
}

pub fn name_error(name: &str) -> String {
    format!("NameError: name '{name}' is not defined")
}

/// Name of a function from an engine signature such as `open (&str)`.
fn bare_name(signature: &str) -> &str {
    let end = signature
        .find(|c: char| c == ' ' || c == '(')
        .unwrap_or(signature.len());
    &signature[..end]
}

/// Primitive disabled at parse time, if that is what the parser tripped on.
fn disabled_primitive<'a>(err: &ParseErrorType, disabled: &[&'a str]) -> Option<&'a str> {
    let symbol = match err {
        ParseErrorType::Reserved(name) => Some(name.as_str()),
        ParseErrorType::BadInput(LexError::ImproperSymbol(name, _)) => Some(name.as_str()),
        _ => None,
    };
    if let Some(symbol) = symbol {
        if let Some(name) = disabled.iter().find(|name| **name == symbol) {
            return Some(*name);
        }
    }
    let text = err.to_string();
    disabled
        .iter()
        .find(|name| text.contains(&format!("'{name}'")))
        .copied()
}

/// Classify a compile failure.
pub fn classify_parse_error(err: &ParseError, disabled: &[&str]) -> (ErrorKind, String) {
    match disabled_primitive(err.err_type(), disabled) {
        Some(name) => (ErrorKind::PrimitiveUnavailable, name_error(name)),
        None => (ErrorKind::CompileError, format!("SyntaxError: {err}")),
    }
}

fn thrown_message(value: &Dynamic) -> String {
    let text = value.to_string();
    let prefixed = text
        .split_once(": ")
        .map(|(kind, _)| {
            kind.ends_with("Error") && kind.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or(false);
    if prefixed {
        text
    } else {
        format!("Exception: {text}")
    }
}

/// Classify a runtime failure. `primitives` is the full primitive catalog,
/// used to tell a revoked primitive from an unknown name.
pub fn classify_runtime_error(
    err: &EvalAltResult,
    primitives: &[&str],
    disabled: &[&str],
) -> Outcome {
    use EvalAltResult as ERR;

    let failed = |kind: ErrorKind, message: String| Outcome::Failed(kind, message);
    let runtime = |message: String| Outcome::Failed(ErrorKind::RuntimeFailure, message);

    match err {
        ERR::ErrorInFunctionCall(_, _, inner, _) | ERR::ErrorInModule(_, inner, _) => {
            classify_runtime_error(inner, primitives, disabled)
        }
        ERR::ErrorTerminated(token, _) => match token.clone().try_cast::<Interrupt>() {
            Some(Interrupt::ImportBlocked(module)) => failed(
                ErrorKind::ImportBlocked,
                format!("ImportError: {module} blocked by policy"),
            ),
            Some(Interrupt::Exit(0)) => Outcome::Finished,
            Some(Interrupt::Exit(status)) => runtime(format!("SystemExit: {status}")),
            Some(Interrupt::CpuTimeExceeded) => failed(
                ErrorKind::ResourceExceeded,
                "CPU time limit exceeded".to_string(),
            ),
            None => runtime(format!("RuntimeError: execution terminated ({token})")),
        },
        ERR::ErrorDataTooLarge(what, _) => {
            log::debug!("engine data ceiling hit: {what}");
            failed(ErrorKind::ResourceExceeded, "Memory limit exceeded".to_string())
        }
        ERR::ErrorParsing(parse_err, _) => match disabled_primitive(parse_err, disabled) {
            Some(name) => failed(ErrorKind::PrimitiveUnavailable, name_error(name)),
            None => runtime(format!("SyntaxError: {parse_err}")),
        },
        ERR::ErrorFunctionNotFound(signature, _) => {
            let name = bare_name(signature);
            if primitives.contains(&name) {
                failed(ErrorKind::PrimitiveUnavailable, name_error(name))
            } else {
                runtime(format!("NameError: function '{signature}' is not defined"))
            }
        }
        ERR::ErrorVariableNotFound(name, _) => runtime(name_error(name)),
        ERR::ErrorModuleNotFound(module, _) => {
            runtime(format!("ModuleNotFoundError: No module named '{module}'"))
        }
        ERR::ErrorArithmetic(message, _) => runtime(format!("ArithmeticError: {message}")),
        ERR::ErrorArrayBounds(len, index, _) => runtime(format!(
            "IndexError: index {index} out of range for array of length {len}"
        )),
        ERR::ErrorStringBounds(len, index, _) => runtime(format!(
            "IndexError: index {index} out of range for string of length {len}"
        )),
        ERR::ErrorIndexNotFound(key, _) => runtime(format!("KeyError: {key}")),
        ERR::ErrorPropertyNotFound(key, _) => runtime(format!("KeyError: '{key}'")),
        ERR::ErrorMismatchDataType(..)
        | ERR::ErrorMismatchOutputType(..)
        | ERR::ErrorIndexingType(..)
        | ERR::ErrorFor(..) => runtime(format!("TypeError: {err}")),
        ERR::ErrorStackOverflow(..) => {
            runtime("RecursionError: maximum recursion depth exceeded".to_string())
        }
        ERR::ErrorTooManyModules(..) => runtime("ImportError: too many modules imported".to_string()),
        ERR::ErrorRuntime(value, _) => runtime(thrown_message(value)),
        _ => runtime(format!("RuntimeError: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMITIVES: &[&str] = &["eval", "open", "print"];

    fn classify(err: EvalAltResult) -> Outcome {
        classify_runtime_error(&err, PRIMITIVES, &["eval"])
    }

    #[test]
    fn interrupts_map_to_kinds() {
        let blocked = Interrupt::ImportBlocked("os".into()).into_error();
        assert_eq!(
            classify(*blocked),
            Outcome::Failed(ErrorKind::ImportBlocked, "ImportError: os blocked by policy".into())
        );
        assert_eq!(classify(*Interrupt::Exit(0).into_error()), Outcome::Finished);
        assert_eq!(
            classify(*Interrupt::Exit(3).into_error()),
            Outcome::Failed(ErrorKind::RuntimeFailure, "SystemExit: 3".into())
        );
        assert!(matches!(
            classify(*Interrupt::CpuTimeExceeded.into_error()),
            Outcome::Failed(ErrorKind::ResourceExceeded, _)
        ));
    }

    #[test]
    fn wrapped_errors_are_unwrapped() {
        let inner = Interrupt::ImportBlocked("os".into()).into_error();
        let wrapped = EvalAltResult::ErrorInFunctionCall(
            "helper".into(),
            String::new(),
            inner,
            Position::NONE,
        );
        assert!(matches!(
            classify(wrapped),
            Outcome::Failed(ErrorKind::ImportBlocked, _)
        ));
    }

    #[test]
    fn missing_primitive_is_reported_by_name() {
        let err = EvalAltResult::ErrorFunctionNotFound(
            "open (&str | ImmutableString | String)".into(),
            Position::NONE,
        );
        assert_eq!(
            classify(err),
            Outcome::Failed(
                ErrorKind::PrimitiveUnavailable,
                "NameError: name 'open' is not defined".into()
            )
        );
        let unknown = EvalAltResult::ErrorFunctionNotFound("frobnicate ()".into(), Position::NONE);
        assert!(matches!(
            classify(unknown),
            Outcome::Failed(ErrorKind::RuntimeFailure, message) if message.starts_with("NameError")
        ));
    }

    #[test]
    fn thrown_values_keep_python_style_prefix() {
        let typed = script_error("ValueError", "bad literal");
        assert_eq!(
            classify(*typed),
            Outcome::Failed(ErrorKind::RuntimeFailure, "ValueError: bad literal".into())
        );
        let plain = EvalAltResult::ErrorRuntime("oops".into(), Position::NONE);
        assert_eq!(
            classify(plain),
            Outcome::Failed(ErrorKind::RuntimeFailure, "Exception: oops".into())
        );
    }

    #[test]
    fn bare_name_strips_signature() {
        assert_eq!(bare_name("open (&str)"), "open");
        assert_eq!(bare_name("exit()"), "exit");
        assert_eq!(bare_name("len"), "len");
    }
}
