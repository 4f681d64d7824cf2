//! Evaluation of the templated values held by Provisioner objects.
//!
//! Every string field of a provisioner spec section is a template. The final
//! string a template renders to is substituted for the field's value, except
//! that a template which sets the variable `yaml` to `true` (for example with
//! `{% set yaml = true %}`) has its output parsed as YAML and the parsed
//! value substituted instead.

use minijinja::value::{Value, ValueKind};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template error: {0}")]
    Evaluation(#[from] minijinja::Error),
    #[error("template output is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Validate the syntax of every template in `value`, without evaluating any.
pub fn validate(value: &JsonValue) -> Result<(), TemplateError> {
    match value {
        JsonValue::Object(fields) => {
            for field in fields.values() {
                validate(field)?;
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                validate(item)?;
            }
        }
        JsonValue::String(text) => {
            let env = environment();
            env.template_from_str(text)?;
        }
        _ => {}
    }
    Ok(())
}

/// Evaluate every string in `value` as a template over `context`, returning
/// the substituted value. `value` itself is not mutated.
///
/// Expressions may operate on undefined values (`{{ absent or 42 }}` is
/// fine), but an expression must not itself evaluate to undefined, and must
/// produce a string, boolean, or numeric value.
pub fn evaluate(value: &JsonValue, context: &JsonValue) -> Result<JsonValue, TemplateError> {
    let env = environment();
    let context = Value::from_serialize(context);
    evaluate_inner(&env, &context, value)
}

fn evaluate_inner(
    env: &Environment,
    context: &Value,
    value: &JsonValue,
) -> Result<JsonValue, TemplateError> {
    match value {
        JsonValue::Object(fields) => {
            let mut evaluated = serde_json::Map::with_capacity(fields.len());
            for (key, field) in fields {
                evaluated.insert(key.clone(), evaluate_inner(env, context, field)?);
            }
            Ok(JsonValue::Object(evaluated))
        }
        JsonValue::Array(items) => {
            let evaluated = items
                .iter()
                .map(|item| evaluate_inner(env, context, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(JsonValue::Array(evaluated))
        }
        JsonValue::String(text) => {
            let template = env.template_from_str(text)?;
            let (rendered, state) = template.render_and_return_state(context.clone())?;
            let wants_yaml = state.lookup("yaml").map(|v| v.is_true()).unwrap_or(false);
            if wants_yaml {
                Ok(serde_yaml::from_str(&rendered)?)
            } else {
                Ok(JsonValue::String(rendered))
            }
        }
        other => Ok(other.clone()),
    }
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    // Allows operations like 'or' on undefined values while still refusing
    // expressions whose own result is undefined.
    env.set_formatter(|output, _state, value| {
        if value.is_undefined() {
            return Err(minijinja::Error::new(
                ErrorKind::UndefinedError,
                "expressions must not evaluate to undefined",
            ));
        }
        match value.kind() {
            ValueKind::String | ValueKind::Number | ValueKind::Bool => std::fmt::Write::write_fmt(
                output,
                format_args!("{}", value),
            )
            .map_err(|_| {
                minijinja::Error::new(ErrorKind::InvalidOperation, "failed to write output")
            }),
            _ => Err(minijinja::Error::new(
                ErrorKind::InvalidOperation,
                "expressions must evaluate to a string or numeric value",
            )),
        }
    });
    env.add_filter("tobash", tobash);
    env
}

/// Quote a value for literal inclusion in a bash command line, escaping
/// newlines with ANSI-C quoting so the result never spans multiple lines.
fn tobash(value: Value) -> Result<String, minijinja::Error> {
    if value.is_undefined() {
        return Err(minijinja::Error::new(
            ErrorKind::UndefinedError,
            "filter 'tobash' may not be applied to undefined",
        ));
    }
    match value.kind() {
        ValueKind::String | ValueKind::Number | ValueKind::Bool => {}
        _ => {
            return Err(minijinja::Error::new(
                ErrorKind::InvalidOperation,
                "filter 'tobash' expects a string or numeric value",
            ))
        }
    }

    let text = value.to_string();
    if text.is_empty() {
        return Ok("''".to_owned());
    }

    let quoted = text
        .split('\n')
        .map(|segment| {
            if segment.is_empty() {
                String::new()
            } else {
                shell_quote(segment)
            }
        })
        .collect::<Vec<_>>()
        .join(r"$'\n'");
    Ok(quoted)
}

fn shell_quote(text: &str) -> String {
    let is_safe = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if is_safe {
        text.to_owned()
    } else {
        format!("'{}'", text.replace('\'', r#"'"'"'"#))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn eval(template: &str) -> Result<JsonValue, TemplateError> {
        evaluate(&json!(template), &json!({}))
    }

    #[test]
    fn expressions_render_to_strings() {
        assert_eq!(eval("{{ 1 + 2 }}").unwrap(), json!("3"));
    }

    #[test]
    fn yaml_flag_parses_the_output() {
        assert_eq!(eval("{% set yaml = true %}{{ 1 + 2 }}").unwrap(), json!(3));
    }

    #[test]
    fn undefined_results_are_rejected() {
        assert!(eval("{{ abc }}").is_err());
    }

    #[test]
    fn operations_on_undefined_are_allowed() {
        assert_eq!(
            eval("{% set yaml = true %}{{ abc or 42 }}").unwrap(),
            json!(42)
        );
    }

    #[test]
    fn tobash_escapes_newlines() {
        assert_eq!(eval("{{ ' a\nb' | tobash }}").unwrap(), json!(r"' a'$'\n'b"));
    }

    #[test]
    fn tobash_quotes_the_empty_string() {
        assert_eq!(eval("{{ '' | tobash }}").unwrap(), json!("''"));
    }

    #[test]
    fn context_values_are_visible() {
        let evaluated = evaluate(
            &json!({"cmd": "create {{ params.pool }}", "mode": "{{ requestedVolumeMode }}"}),
            &json!({"params": {"pool": "tank"}, "requestedVolumeMode": "Filesystem"}),
        )
        .unwrap();
        assert_eq!(
            evaluated,
            json!({"cmd": "create tank", "mode": "Filesystem"})
        );
    }

    #[test]
    fn non_string_values_pass_through() {
        let evaluated = evaluate(&json!({"n": 7, "b": true, "x": null}), &json!({})).unwrap();
        assert_eq!(evaluated, json!({"n": 7, "b": true, "x": null}));
    }

    #[test]
    fn validate_rejects_bad_syntax() {
        assert!(validate(&json!("{{ open")).is_err());
        assert!(validate(&json!({"nested": ["{% if %}"]})).is_err());
        assert!(validate(&json!({"ok": "{{ 1 + 2 }}", "n": 3})).is_ok());
    }
}
