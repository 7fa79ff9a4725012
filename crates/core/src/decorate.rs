use crate::event::{Event, TAGS_FIELD, TYPE_FIELD};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-input enrichment applied to every event before record properties.
pub trait Decorate: Send + Sync {
    fn decorate(&self, event: &mut Event);
}

pub struct NoDecoration;

impl Decorate for NoDecoration {
    fn decorate(&self, _event: &mut Event) {}
}

impl<F> Decorate for F
where
    F: Fn(&mut Event) + Send + Sync,
{
    fn decorate(&self, event: &mut Event) {
        self(event)
    }
}

/// `type`, `tags` and `add_field` handling shared by every input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDecorator {
    event_type: Option<String>,
    tags: Vec<String>,
    add_field: BTreeMap<String, String>,
}

impl FieldDecorator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: Option<String>) -> Self {
        self.event_type = event_type.filter(|t| !t.is_empty());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.add_field = fields;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.event_type.is_none() && self.tags.is_empty() && self.add_field.is_empty()
    }

    fn add_tag(event: &mut Event, tag: &str) {
        let mut tags = match event.remove(TAGS_FIELD) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        if !tags.iter().any(|t| t.as_str() == Some(tag)) {
            tags.push(Value::String(tag.to_string()));
        }
        event.set(TAGS_FIELD, Value::Array(tags));
    }

    fn add_value(event: &mut Event, field: &str, value: String) {
        match event.get_mut(field) {
            None => event.set(field, value),
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, Value::String(value)]);
            }
        }
    }
}

impl Decorate for FieldDecorator {
    fn decorate(&self, event: &mut Event) {
        if let Some(event_type) = &self.event_type {
            if !event.contains(TYPE_FIELD) {
                event.set(TYPE_FIELD, event_type.as_str());
            }
        }

        for tag in &self.tags {
            Self::add_tag(event, tag);
        }

        for (field, template) in &self.add_field {
            let field = interpolate(field, event);
            let value = interpolate(template, event);
            Self::add_value(event, &field, value);
        }
    }
}

/// Expands `%{field}` references with the event's current values.
/// Unknown references are kept verbatim.
pub fn interpolate(template: &str, event: &Event) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match event.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => out.push_str(&rest[start..start + 2 + end + 1]),
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
