//! Builders for export JSON.

#![allow(dead_code)]

use serde_json::{json, Map, Value};

/// Epoch seconds for a UTC date and time.
pub fn epoch(date: &str, time: &str) -> f64 {
    let instant = chrono::DateTime::parse_from_rfc3339(&format!("{date}T{time}Z"))
        .expect("Invalid date or time");
    instant.timestamp() as f64
}

/// Builds one conversation of the branching export format.
pub struct ConversationBuilder {
    id: String,
    title: String,
    mapping: Map<String, Value>,
    tail: String,
    counter: usize,
}

impl ConversationBuilder {
    /// Starts with a payload-less root node named `root`.
    pub fn new(id: &str) -> Self {
        let mut mapping = Map::new();
        mapping.insert(
            "root".to_string(),
            json!({"id": "root", "message": null, "parent": null, "children": []}),
        );
        Self {
            id: id.to_string(),
            title: format!("Conversation {id}"),
            mapping,
            tail: "root".to_string(),
            counter: 0,
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    /// Appends a finished message below the current tail.
    pub fn message(self, role: &str, text: &str, create_time: f64) -> Self {
        self.push(role, text, create_time, "finished_successfully")
    }

    /// Appends a message whose generation never finished.
    pub fn unfinished(self, role: &str, text: &str, create_time: f64) -> Self {
        self.push(role, text, create_time, "in_progress")
    }

    /// Appends `count` finished user messages one second apart.
    pub fn messages(mut self, count: usize, start: f64) -> Self {
        for i in 0..count {
            self = self.message("user", &format!("message {i}"), start + i as f64);
        }
        self
    }

    /// Makes the current tail list `node` as a child, closing a cycle.
    pub fn link_tail_to(mut self, node: &str) -> Self {
        let tail = self.tail.clone();
        self.add_child(&tail, node);
        self
    }

    pub fn tail(&self) -> &str {
        &self.tail
    }

    pub fn build(self) -> Value {
        json!({
            "title": self.title,
            "conversation_id": self.id,
            "create_time": null,
            "mapping": self.mapping,
        })
    }

    fn push(mut self, role: &str, text: &str, create_time: f64, status: &str) -> Self {
        self.counter += 1;
        let node = format!("n{:05}", self.counter);
        let parent = self.tail.clone();
        self.mapping.insert(
            node.clone(),
            json!({
                "id": node,
                "parent": parent,
                "children": [],
                "message": {
                    "id": format!("{}-{}", self.id, node),
                    "author": {"role": role},
                    "create_time": create_time,
                    "content": {"content_type": "text", "parts": [text]},
                    "status": status,
                    "metadata": {},
                },
            }),
        );
        self.add_child(&parent, &node);
        self.tail = node;
        self
    }

    fn add_child(&mut self, parent: &str, child: &str) {
        if let Some(children) = self
            .mapping
            .get_mut(parent)
            .and_then(|n| n.get_mut("children"))
            .and_then(Value::as_array_mut)
        {
            children.push(Value::String(child.to_string()));
        }
    }
}

/// Serializes conversations as a `conversations.json` document.
pub fn export_json(conversations: Vec<Value>) -> Vec<u8> {
    serde_json::to_vec(&Value::Array(conversations)).expect("Failed to serialize export")
}
