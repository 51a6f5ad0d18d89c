//! Variable extraction from a completed request.
//!
//! Reserved path forms are resolved here; everything else goes through the
//! host's [`PathEvaluator`] against the response body:
//!
//! | Path | Source |
//! |------|--------|
//! | `.status` | response status code |
//! | `headers.<name>` | response header, name matched case-insensitively |
//! | `body` | the whole parsed body |
//! | `body.<path>`, `body[..]` | `<path>` evaluated against the body |
//! | anything else | evaluated against the body |

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::EvalError;
use crate::model::{Context, ExtractionFailure};
use crate::strategy::PathEvaluator;

use super::panic_guard::guarded;

/// Outcome of applying one step's extraction rules.
#[derive(Debug, Default, PartialEq)]
pub struct ExtractionReport {
    pub failures: Vec<ExtractionFailure>,
    /// At least one variable ended up with a different value.
    pub changed: bool,
}

/// Apply `rules` to a request `output` (`{status, headers, body}`), writing
/// into `context` in place. Never fails: unresolvable rules clear their
/// variable and are reported.
pub fn apply_extractions(
    rules: &BTreeMap<String, String>,
    output: &Value,
    context: &mut Context,
    evaluator: &dyn PathEvaluator,
) -> ExtractionReport {
    let mut report = ExtractionReport::default();

    for (var_name, path) in rules {
        let resolved = guarded(|| resolve(output, path, evaluator))
            .unwrap_or_else(|panic| Err(EvalError::new(panic)));

        let previous = match resolved {
            Ok(Some(value)) => {
                let changed = context.get(var_name) != Some(&value);
                report.changed |= changed;
                context.set(var_name.clone(), value);
                continue;
            }
            Ok(None) => {
                report.failures.push(ExtractionFailure {
                    var_name: var_name.clone(),
                    path: path.clone(),
                    reason: "path not found".to_string(),
                });
                context.unset(var_name)
            }
            Err(e) => {
                report.failures.push(ExtractionFailure {
                    var_name: var_name.clone(),
                    path: path.clone(),
                    reason: e.to_string(),
                });
                context.unset(var_name)
            }
        };
        report.changed |= previous.is_some();
        tracing::warn!(var = %var_name, path = %path, "extraction produced no value");
    }

    report
}

fn resolve(output: &Value, path: &str, evaluator: &dyn PathEvaluator) -> Result<Option<Value>, EvalError> {
    let path = path.trim();
    let body = output.get("body").unwrap_or(&Value::Null);

    if path == ".status" {
        return Ok(output.get("status").cloned());
    }
    if let Some(name) = strip_prefix_ignore_case(path, "headers.") {
        return Ok(output
            .get("headers")
            .and_then(Value::as_object)
            .and_then(|headers| {
                headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.clone())
            }));
    }
    if path == "body" {
        return Ok(Some(body.clone()));
    }
    if let Some(rest) = path.strip_prefix("body.") {
        return evaluator.evaluate(body, rest);
    }
    if path.starts_with("body[") {
        return evaluator.evaluate(body, &path["body".len()..]);
    }
    evaluator.evaluate(body, path)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
