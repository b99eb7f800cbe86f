//! Flattening of a profile document into knowledge records.
//!
//! A profile is a free-form JSON object (`name`, `current_role`, `education: {...}`,
//! `work_experience: [...]`, ...). Each section becomes one searchable record whose
//! question is the humanised section title:
//!
//! - all scalar top-level fields → one "Basic Information" record,
//! - an object → one record (`Key: value. Key: value`),
//! - an array of scalars → one record (`a, b, c`),
//! - an array of objects → one record per item.
//!
//! Empty values are skipped. Sections keep the document's key order.

use serde_json::{Map, Value};

const BASIC_INFORMATION: &str = "Basic Information";

/// One flattened section of a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSection {
    pub title: String,
    pub text: String,
}

pub fn records_from_profile(profile: &Map<String, Value>) -> Vec<ProfileSection> {
    let mut basic = Vec::new();
    let mut sections = Vec::new();

    for (key, value) in profile {
        match value {
            Value::Object(fields) => {
                let text = render_object(fields, ". ");
                if !text.is_empty() {
                    sections.push(ProfileSection {
                        title: humanize(key),
                        text,
                    });
                }
            }
            Value::Array(items) if items.iter().any(Value::is_object) => {
                let title = humanize(key);
                for item in items {
                    let text = match item {
                        Value::Object(fields) => render_object(fields, ", "),
                        other => render_scalar(other).unwrap_or_default(),
                    };
                    if !text.is_empty() {
                        sections.push(ProfileSection {
                            title: title.clone(),
                            text,
                        });
                    }
                }
            }
            Value::Array(items) => {
                let text = join_scalars(items);
                if !text.is_empty() {
                    sections.push(ProfileSection {
                        title: humanize(key),
                        text,
                    });
                }
            }
            scalar => {
                if let Some(text) = render_scalar(scalar) {
                    basic.push(format!("{}: {}", humanize(key), text));
                }
            }
        }
    }

    if !basic.is_empty() {
        sections.insert(
            0,
            ProfileSection {
                title: BASIC_INFORMATION.to_string(),
                text: basic.join(", "),
            },
        );
    }

    sections
}

fn render_object(fields: &Map<String, Value>, separator: &str) -> String {
    fields
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Array(items) => Some(join_scalars(items)).filter(|t| !t.is_empty()),
                Value::Object(nested) => Some(render_object(nested, "; ")).filter(|t| !t.is_empty()),
                scalar => render_scalar(scalar),
            }?;
            Some(format!("{}: {}", humanize(key), text))
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn join_scalars(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(render_scalar)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "yes" } else { "no" }.to_string()),
        _ => None,
    }
}

/// `current_role` → `Current Role`.
fn humanize(key: &str) -> String {
    key.split(['_', '-'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
