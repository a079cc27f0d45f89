//! Module catalog: everything a script can `import`, subject to policy.
//!
//! Modules are built fresh for every import; none of them hold state that
//! outlives the execution.
use crate::worker::classify::script_error;
use crate::worker::convert::{dynamic_to_json, json_to_dynamic};
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Module, FLOAT, INT};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Every module the catalog can build.
pub const MODULE_NAMES: &[&str] = &["json", "math", "os", "os.path", "stats", "time"];

pub fn build_module(name: &str) -> Option<Module> {
    let mut module = match name {
        "json" => json_module(),
        "math" => math_module(),
        "os" => os_module(),
        "os.path" => os_path_module(),
        "stats" => stats_module(),
        "time" => time_module(),
        _ => return None,
    };
    module.set_id(name);
    module.build_index();
    Some(module)
}

fn math_module() -> Module {
    let mut m = Module::new();
    m.set_var("PI", std::f64::consts::PI);
    m.set_var("E", std::f64::consts::E);
    m.set_var("TAU", std::f64::consts::TAU);
    m.set_var("INF", FLOAT::INFINITY);

    m.set_native_fn("sqrt", |x: FLOAT| sqrt(x));
    m.set_native_fn("sqrt", |x: INT| sqrt(x as FLOAT));
    m.set_native_fn("pow", |x: FLOAT, y: FLOAT| Ok(x.powf(y)));
    m.set_native_fn("pow", |x: INT, y: INT| Ok((x as FLOAT).powf(y as FLOAT)));
    m.set_native_fn("pow", |x: FLOAT, y: INT| Ok(x.powf(y as FLOAT)));
    m.set_native_fn("exp", |x: FLOAT| Ok(x.exp()));
    m.set_native_fn("log", |x: FLOAT| log_base(x, std::f64::consts::E));
    m.set_native_fn("log", |x: INT| log_base(x as FLOAT, std::f64::consts::E));
    m.set_native_fn("log", |x: FLOAT, base: FLOAT| log_base(x, base));
    m.set_native_fn("log10", |x: FLOAT| log_base(x, 10.0));
    m.set_native_fn("log10", |x: INT| log_base(x as FLOAT, 10.0));
    m.set_native_fn("floor", |x: FLOAT| Ok(x.floor() as INT));
    m.set_native_fn("floor", |x: INT| Ok(x));
    m.set_native_fn("ceil", |x: FLOAT| Ok(x.ceil() as INT));
    m.set_native_fn("ceil", |x: INT| Ok(x));
    m.set_native_fn("fabs", |x: FLOAT| Ok(x.abs()));
    m.set_native_fn("fabs", |x: INT| Ok((x as FLOAT).abs()));
    m.set_native_fn("sin", |x: FLOAT| Ok(x.sin()));
    m.set_native_fn("cos", |x: FLOAT| Ok(x.cos()));
    m.set_native_fn("tan", |x: FLOAT| Ok(x.tan()));
    m.set_native_fn("atan2", |y: FLOAT, x: FLOAT| Ok(y.atan2(x)));
    m.set_native_fn("isnan", |x: FLOAT| Ok(x.is_nan()));
    m.set_native_fn("isfinite", |x: FLOAT| Ok(x.is_finite()));
    m
}

fn sqrt(x: FLOAT) -> FnResult<FLOAT> {
    if x < 0.0 {
        return Err(script_error("ValueError", "math domain error"));
    }
    Ok(x.sqrt())
}

fn log_base(x: FLOAT, base: FLOAT) -> FnResult<FLOAT> {
    if x <= 0.0 || base <= 0.0 || base == 1.0 {
        return Err(script_error("ValueError", "math domain error"));
    }
    Ok(x.ln() / base.ln())
}

/// Numeric view of an array, for the stats functions.
fn numbers(values: &Array, func: &str) -> FnResult<Vec<FLOAT>> {
    values
        .iter()
        .map(|v| {
            v.as_float()
                .or_else(|_| v.as_int().map(|i| i as FLOAT))
                .map_err(|kind| {
                    script_error("TypeError", format!("{func}() got a non-number: {kind}"))
                })
        })
        .collect()
}

fn mean(values: &[FLOAT], func: &str) -> FnResult<FLOAT> {
    if values.is_empty() {
        return Err(script_error(
            "StatisticsError",
            format!("{func} requires at least one data point"),
        ));
    }
    Ok(values.iter().sum::<FLOAT>() / values.len() as FLOAT)
}

/// Sum of squared deviations and the divisor for sample or population.
fn variance(values: &[FLOAT], sample: bool, func: &str) -> FnResult<FLOAT> {
    let needed = if sample { 2 } else { 1 };
    if values.len() < needed {
        return Err(script_error(
            "StatisticsError",
            format!("{func} requires at least {needed} data points"),
        ));
    }
    let avg = mean(values, func)?;
    let squares: FLOAT = values.iter().map(|v| (v - avg).powi(2)).sum();
    let divisor = if sample { values.len() - 1 } else { values.len() };
    Ok(squares / divisor as FLOAT)
}

fn stats_module() -> Module {
    let mut m = Module::new();
    m.set_native_fn("mean", |values: Array| -> FnResult<FLOAT> {
        mean(&numbers(&values, "mean")?, "mean")
    });
    m.set_native_fn("median", |values: Array| -> FnResult<FLOAT> {
        let mut data = numbers(&values, "median")?;
        if data.is_empty() {
            return Err(script_error("StatisticsError", "no median for empty data"));
        }
        data.sort_by(|a, b| a.total_cmp(b));
        let mid = data.len() / 2;
        Ok(if data.len() % 2 == 1 {
            data[mid]
        } else {
            (data[mid - 1] + data[mid]) / 2.0
        })
    });
    m.set_native_fn("variance", |values: Array| -> FnResult<FLOAT> {
        variance(&numbers(&values, "variance")?, true, "variance")
    });
    m.set_native_fn("stdev", |values: Array| -> FnResult<FLOAT> {
        variance(&numbers(&values, "stdev")?, true, "stdev").map(FLOAT::sqrt)
    });
    m.set_native_fn("pvariance", |values: Array| -> FnResult<FLOAT> {
        variance(&numbers(&values, "pvariance")?, false, "pvariance")
    });
    m.set_native_fn("pstdev", |values: Array| -> FnResult<FLOAT> {
        variance(&numbers(&values, "pstdev")?, false, "pstdev").map(FLOAT::sqrt)
    });
    m
}

fn json_module() -> Module {
    let mut m = Module::new();
    m.set_native_fn("parse", |text: ImmutableString| -> FnResult<Dynamic> {
        let value: serde_json::Value = serde_json::from_str(text.as_str())
            .map_err(|e| script_error("JSONDecodeError", e))?;
        json_to_dynamic(&value).map_err(|e| script_error("ValueError", e))
    });
    m.set_native_fn("stringify", |value: Dynamic| stringify(&value, false));
    m.set_native_fn("stringify", |value: Dynamic, pretty: bool| stringify(&value, pretty));
    m
}

fn stringify(value: &Dynamic, pretty: bool) -> FnResult<ImmutableString> {
    let json = dynamic_to_json(value).map_err(|e| script_error("TypeError", e))?;
    let text = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    text.map(Into::into).map_err(|e| script_error("ValueError", e))
}

fn time_module() -> Module {
    let started = Instant::now();
    let mut m = Module::new();
    m.set_native_fn("now", || -> FnResult<FLOAT> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| script_error("OSError", e))?;
        Ok(since_epoch.as_secs_f64())
    });
    m.set_native_fn("monotonic", move || Ok(started.elapsed().as_secs_f64()));
    m.set_native_fn("sleep", |seconds: FLOAT| sleep(seconds));
    m.set_native_fn("sleep", |seconds: INT| sleep(seconds as FLOAT));
    m
}

fn sleep(seconds: FLOAT) -> FnResult<()> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(script_error("ValueError", "sleep length must be non-negative"));
    }
    let length = Duration::try_from_secs_f64(seconds)
        .map_err(|_| script_error("OverflowError", "sleep length is too large"))?;
    std::thread::sleep(length);
    Ok(())
}

fn os_error(err: std::io::Error, path: &str) -> Box<EvalAltResult> {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => "FileNotFoundError",
        std::io::ErrorKind::PermissionDenied => "PermissionError",
        _ => "OSError",
    };
    script_error(kind, format!("{err}: '{path}'"))
}

fn os_module() -> Module {
    let mut m = Module::new();
    m.set_var("sep", std::path::MAIN_SEPARATOR.to_string());
    m.set_native_fn("getenv", |name: ImmutableString| {
        Ok(std::env::var(name.as_str()).map(Dynamic::from).unwrap_or(Dynamic::UNIT))
    });
    m.set_native_fn("getcwd", || {
        std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .map_err(|e| os_error(e, "."))
    });
    m.set_native_fn("getpid", || Ok(std::process::id() as INT));
    m.set_native_fn("read_file", |path: ImmutableString| {
        std::fs::read_to_string(path.as_str()).map_err(|e| os_error(e, &path))
    });
    m.set_native_fn("listdir", |path: ImmutableString| -> FnResult<Array> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path.as_str()).map_err(|e| os_error(e, &path))? {
            let entry = entry.map_err(|e| os_error(e, &path))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names.into_iter().map(Dynamic::from).collect())
    });
    m
}

fn os_path_module() -> Module {
    use std::path::Path;

    let mut m = Module::new();
    m.set_native_fn("join", |a: ImmutableString, b: ImmutableString| {
        Ok(Path::new(a.as_str()).join(b.as_str()).display().to_string())
    });
    m.set_native_fn("exists", |path: ImmutableString| Ok(Path::new(path.as_str()).exists()));
    m.set_native_fn("basename", |path: ImmutableString| {
        Ok(Path::new(path.as_str())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default())
    });
    m.set_native_fn("dirname", |path: ImmutableString| {
        Ok(Path::new(path.as_str())
            .parent()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default())
    });
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_module_builds() {
        for name in MODULE_NAMES {
            assert!(build_module(name).is_some(), "{name}");
        }
        assert!(build_module("subprocess").is_none());
    }

    #[test]
    fn math_exposes_constants() {
        let module = build_module("math").unwrap();
        assert!(module.contains_var("PI"));
        assert!(module.contains_var("E"));
    }

    #[test]
    fn stats_helpers() {
        assert_eq!(mean(&[1.0, 2.0, 3.0], "mean").unwrap(), 2.0);
        assert!(mean(&[], "mean").is_err());
        assert_eq!(variance(&[1.0, 2.0, 3.0, 4.0], true, "variance").unwrap(), 5.0 / 3.0);
        assert_eq!(variance(&[1.0, 3.0], false, "pvariance").unwrap(), 1.0);
        assert!(variance(&[1.0], true, "stdev").is_err());
    }

    #[test]
    fn numbers_rejects_strings() {
        let values: Array = vec![Dynamic::from(1_i64), Dynamic::from(String::from("x"))];
        assert!(numbers(&values, "mean").is_err());
        let mixed: Array = vec![Dynamic::from(1_i64), Dynamic::from(2.5_f64)];
        assert_eq!(numbers(&mixed, "mean").unwrap(), vec![1.0, 2.5]);
    }

    #[test]
    fn sleep_rejects_out_of_range_lengths() {
        let err = sleep(1e300).unwrap_err();
        assert!(err.to_string().contains("OverflowError"), "{err}");
        assert!(sleep(-1.0).is_err());
        assert!(sleep(FLOAT::NAN).is_err());
        assert!(sleep(0.0).is_ok());
    }

    #[test]
    fn math_domain_errors() {
        assert!(sqrt(-1.0).is_err());
        assert_eq!(sqrt(81.0).unwrap(), 9.0);
        assert!(log_base(0.0, 10.0).is_err());
    }
}
