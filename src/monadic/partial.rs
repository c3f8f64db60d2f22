//! Incremental envelope parsing for monadic responses that are still
//! streaming.
//!
//! Text is scanned once as it arrives. Every complete top-level JSON object
//! found in it is merged into a running envelope, so a UI can show the
//! `context` before the response has finished.

use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct PartialEnvelopeParser {
    buffer: String,
    /// Byte offset in `buffer` up to which characters have been scanned
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Start of the object currently being scanned
    start: Option<usize>,
    merged: Map<String, Value>,
    objects: usize,
}

impl PartialEnvelopeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text. Returns true if it completed at least one object.
    pub fn feed(&mut self, chunk: &str) -> bool {
        self.buffer.push_str(chunk);
        let mut completed = false;
        let mut consumed = 0;

        for (i, c) in self.buffer[self.scanned..].char_indices() {
            let i = i + self.scanned;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match c {
                '"' if self.depth > 0 => self.in_string = true,
                '{' => {
                    if self.depth == 0 {
                        self.start = Some(i);
                    }
                    self.depth += 1;
                }
                '}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.start.take() {
                            let candidate = &self.buffer[start..=i];
                            match serde_json::from_str::<Value>(candidate) {
                                Ok(Value::Object(obj)) => {
                                    merge_envelope(&mut self.merged, obj);
                                    self.objects += 1;
                                    completed = true;
                                }
                                _ => tracing::debug!("skipping unparseable object in monadic stream"),
                            }
                        }
                        consumed = i + 1;
                    }
                }
                _ => {}
            }
        }

        // Drop everything before the open object (or all of it)
        let keep_from = self.start.unwrap_or(self.buffer.len()).max(consumed);
        self.buffer.drain(..keep_from);
        if let Some(start) = self.start.as_mut() {
            *start -= keep_from;
        }
        self.scanned = self.buffer.len();

        completed
    }

    /// Number of complete objects merged so far.
    pub fn objects_seen(&self) -> usize {
        self.objects
    }

    /// The envelope merged so far, or `{}` if nothing was complete.
    pub fn partial(&self) -> Value {
        Value::Object(self.merged.clone())
    }

    pub fn finish(self) -> Value {
        Value::Object(self.merged)
    }
}

/// Merge one envelope object into the running one. Messages concatenate,
/// everything else deep-merges.
fn merge_envelope(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(Value::String(existing)) if key == "message" && value.is_string() => {
                existing.push_str(value.as_str().unwrap_or_default());
            }
            Some(existing) => deep_merge(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

/// Objects merge key by key, arrays concatenate without duplicates, and
/// anything else is overwritten.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => {
            for (key, value) in s {
                match t.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        t.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(t), Value::Array(s)) => {
            for item in s {
                if !t.contains(&item) {
                    t.push(item);
                }
            }
        }
        (t, s) => *t = s,
    }
}
