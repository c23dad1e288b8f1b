//! Event-broker event records and match criteria

use std::fmt;

/// One decoded event-broker event: a type name and ordered key/value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_type: String,
    pub fields: Vec<(String, String)>,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field append
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_type)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// What a step expects to see: an event type plus required key/value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCriteria {
    pub event_type: String,
    pub required: Vec<(String, String)>,
}

impl MatchCriteria {
    pub fn new(event_type: impl Into<String>, required: Vec<(String, String)>) -> Self {
        Self {
            event_type: event_type.into(),
            required,
        }
    }

    /// Whether `record` satisfies the criteria
    ///
    /// Extra keys in the record are ignored. Each required key must be
    /// present, and every occurrence of it must carry the expected value.
    pub fn matches(&self, record: &EventRecord) -> bool {
        if record.event_type != self.event_type {
            return false;
        }

        self.required.iter().all(|(key, expected)| {
            let mut found = false;
            for (k, v) in &record.fields {
                if k == key {
                    if v != expected {
                        return false;
                    }
                    found = true;
                }
            }
            found
        })
    }
}

impl fmt::Display for MatchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_type)?;
        for (key, value) in &self.required {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}
