//! Structural validation of upstream output against the envelope schema.
//!
//! Validation works on the parsed JSON value rather than on serde errors so
//! that every problem is reported in one pass; the corrective retry
//! instruction lists all of them.

use serde_json::{Map, Value};

use crate::envelope::{FieldKind, ResponseEnvelope};

/// Result of validating one upstream reply.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub envelope: Option<ResponseEnvelope>,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            envelope: None,
            errors,
        }
    }
}

/// Strip one enclosing markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line
    match body.find('\n') {
        Some(newline) if !body[..newline].trim().contains(['{', '[']) => body[newline + 1..].trim(),
        _ => body.trim(),
    }
}

/// Validate raw upstream text.
pub fn validate(text: &str) -> ValidationOutcome {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return ValidationOutcome::invalid(vec!["response is empty".into()]);
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return ValidationOutcome::invalid(vec![format!("response is not valid JSON: {e}")]),
    };

    validate_value(&value)
}

/// Validate an already-parsed JSON value.
pub fn validate_value(value: &Value) -> ValidationOutcome {
    let Some(root) = value.as_object() else {
        return ValidationOutcome::invalid(vec!["response must be a JSON object".into()]);
    };

    let mut errors = Vec::new();

    match root.get("type") {
        None => errors.push("missing field `type`".into()),
        Some(Value::String(s)) if s == "response" => {}
        Some(_) => errors.push("`type` must be \"response\"".into()),
    }

    if let Some(safety) = object_field(root, "safety", &mut errors) {
        check_safety(safety, &mut errors);
    }

    if let Some(content) = object_field(root, "content", &mut errors) {
        check_content(content, &mut errors);
    }

    if let Some(progress) = root.get("progress").filter(|v| !v.is_null()) {
        match progress.as_object() {
            Some(p) => check_progress(p, &mut errors),
            None => errors.push("`progress` must be an object".into()),
        }
    }

    if let Some(metadata) = object_field(root, "metadata", &mut errors) {
        check_metadata(metadata, &mut errors);
    }

    if !errors.is_empty() {
        return ValidationOutcome::invalid(errors);
    }

    match serde_json::from_value::<ResponseEnvelope>(value.clone()) {
        Ok(envelope) => ValidationOutcome {
            valid: true,
            envelope: Some(envelope),
            errors: Vec::new(),
        },
        Err(e) => ValidationOutcome::invalid(vec![format!("response does not match the schema: {e}")]),
    }
}

fn object_field<'a>(parent: &'a Map<String, Value>, key: &str, errors: &mut Vec<String>) -> Option<&'a Map<String, Value>> {
    match parent.get(key) {
        None | Some(Value::Null) => {
            errors.push(format!("missing field `{key}`"));
            None
        }
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            errors.push(format!("`{key}` must be an object"));
            None
        }
    }
}

fn require_bool(obj: &Map<String, Value>, path: &str, key: &str, errors: &mut Vec<String>) {
    match obj.get(key) {
        Some(Value::Bool(_)) => {}
        None => errors.push(format!("missing field `{path}.{key}`")),
        Some(_) => errors.push(format!("`{path}.{key}` must be a boolean")),
    }
}

fn require_string(obj: &Map<String, Value>, path: &str, key: &str, errors: &mut Vec<String>) {
    match obj.get(key) {
        Some(Value::String(_)) => {}
        None => errors.push(format!("missing field `{path}.{key}`")),
        Some(_) => errors.push(format!("`{path}.{key}` must be a string")),
    }
}

fn optional_string(obj: &Map<String, Value>, path: &str, key: &str, errors: &mut Vec<String>) {
    match obj.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => errors.push(format!("`{path}.{key}` must be a string or null")),
    }
}

fn string_array(obj: &Map<String, Value>, path: &str, key: &str, required: bool, errors: &mut Vec<String>) {
    match obj.get(key) {
        None if required => errors.push(format!("missing field `{path}.{key}`")),
        None | Some(Value::Null) if !required => {}
        Some(Value::Array(items)) => {
            if items.iter().any(|i| !i.is_string()) {
                errors.push(format!("`{path}.{key}` must contain only strings"));
            }
        }
        _ => errors.push(format!("`{path}.{key}` must be an array of strings")),
    }
}

fn check_safety(safety: &Map<String, Value>, errors: &mut Vec<String>) {
    require_bool(safety, "safety", "is_safe", errors);
    require_bool(safety, "safety", "requires_intervention", errors);

    match safety.get("danger_level") {
        None | Some(Value::Null) => {}
        Some(Value::String(level)) => {
            if !matches!(level.as_str(), "none" | "warning" | "critical" | "emergency") {
                errors.push(format!(
                    "`safety.danger_level` must be null, \"warning\", \"critical\" or \"emergency\", got \"{level}\""
                ));
            }
        }
        Some(_) => errors.push("`safety.danger_level` must be a string or null".into()),
    }

    string_array(safety, "safety", "detected_concerns", true, errors);
    optional_string(safety, "safety", "safety_message", errors);
}

fn check_content(content: &Map<String, Value>, errors: &mut Vec<String>) {
    match content.get("text_blocks") {
        None | Some(Value::Null) => errors.push("missing field `content.text_blocks`".into()),
        Some(Value::Array(blocks)) if blocks.is_empty() => {
            errors.push("`content.text_blocks` must contain at least one block".into())
        }
        Some(Value::Array(blocks)) => {
            for (i, block) in blocks.iter().enumerate() {
                let path = format!("content.text_blocks[{i}]");
                match block.as_object() {
                    Some(b) => {
                        require_string(b, &path, "type", errors);
                        require_string(b, &path, "content", errors);
                        optional_string(b, &path, "style", errors);
                    }
                    None => errors.push(format!("`{path}` must be an object")),
                }
            }
        }
        Some(_) => errors.push("`content.text_blocks` must be an array".into()),
    }

    if let Some(form) = content.get("form").filter(|v| !v.is_null()) {
        match form.as_object() {
            Some(f) => check_form(f, errors),
            None => errors.push("`content.form` must be an object".into()),
        }
    }

    match content.get("media") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                let path = format!("content.media[{i}]");
                match item.as_object() {
                    Some(m) => {
                        require_string(m, &path, "type", errors);
                        require_string(m, &path, "url", errors);
                    }
                    None => errors.push(format!("`{path}` must be an object")),
                }
            }
        }
        Some(_) => errors.push("`content.media` must be an array".into()),
    }

    string_array(content, "content", "suggestions", false, errors);
}

fn check_form(form: &Map<String, Value>, errors: &mut Vec<String>) {
    let fields = match form.get("fields") {
        Some(Value::Array(fields)) => fields,
        None => {
            errors.push("missing field `content.form.fields`".into());
            return;
        }
        Some(_) => {
            errors.push("`content.form.fields` must be an array".into());
            return;
        }
    };

    for (i, field) in fields.iter().enumerate() {
        let path = format!("content.form.fields[{i}]");
        let Some(f) = field.as_object() else {
            errors.push(format!("`{path}` must be an object"));
            continue;
        };

        require_string(f, &path, "name", errors);

        let kind = match f.get("type") {
            Some(Value::String(k)) => match FieldKind::parse(k) {
                Some(kind) => Some(kind),
                None => {
                    errors.push(format!(
                        "`{path}.type` \"{k}\" is not one of {}",
                        FieldKind::ALL.join(", ")
                    ));
                    None
                }
            },
            None => {
                errors.push(format!("missing field `{path}.type`"));
                None
            }
            Some(_) => {
                errors.push(format!("`{path}.type` must be a string"));
                None
            }
        };

        let options = f.get("options").filter(|v| !v.is_null());
        match (kind, options) {
            (Some(kind), Some(Value::Array(opts))) if kind.takes_options() => {
                if opts.is_empty() {
                    errors.push(format!("`{path}.options` must not be empty for a {} field", kind.as_str()));
                }
            }
            (Some(kind), None) if kind.takes_options() => {
                errors.push(format!("`{path}` is a {} field and needs an `options` list", kind.as_str()));
            }
            (Some(kind), Some(_)) if !kind.takes_options() => {
                errors.push(format!("`{path}` is a {} field and must not have `options`", kind.as_str()));
            }
            (Some(_), Some(_)) => errors.push(format!("`{path}.options` must be an array")),
            _ => {}
        }
    }
}

fn check_progress(progress: &Map<String, Value>, errors: &mut Vec<String>) {
    match progress.get("percentage") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) => {
            let pct = n.as_f64().unwrap_or(-1.0);
            if !(0.0..=100.0).contains(&pct) {
                errors.push("`progress.percentage` must be between 0 and 100".into());
            }
        }
        Some(_) => errors.push("`progress.percentage` must be a number".into()),
    }

    optional_string(progress, "progress", "current_topic", errors);

    for key in ["topics_covered", "topics_remaining"] {
        match progress.get(key) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_u64().is_some() => {}
            Some(_) => errors.push(format!("`progress.{key}` must be a non-negative integer")),
        }
    }
}

fn check_metadata(metadata: &Map<String, Value>, errors: &mut Vec<String>) {
    require_string(metadata, "metadata", "model", errors);
    optional_string(metadata, "metadata", "language", errors);
    match metadata.get("tokens_used") {
        None | Some(Value::Null) => {}
        Some(v) if v.as_u64().is_some() => {}
        Some(_) => errors.push("`metadata.tokens_used` must be a non-negative integer".into()),
    }
}
