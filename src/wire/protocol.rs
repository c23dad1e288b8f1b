//! Cucumber wire protocol message types
//!
//! Every message is a JSON array whose first element names the verb (for
//! requests) or the outcome (for replies):
//!
//! ```text
//! ["step_matches", {"name_to_match": "I succeed"}]
//! ["invoke", {"id": ["test", 1], "args": []}]
//! ["begin_scenario", {"tags": ["test"]}]
//! ["end_scenario"]
//!
//! ["success"]
//! ["success", [{"id": ["test", 1], "args": [], "source": "test"}]]
//! ["fail", {"message": "Step error", "exception": "CukeMerlin-execution"}]
//! ```

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::common::error::WireError;
use crate::common::{Error, Result};

/// Identity of a registered step: module tag plus ordinal within the module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepId {
    pub tag: String,
    pub ordinal: i64,
}

impl StepId {
    pub fn new(tag: impl Into<String>, ordinal: usize) -> Self {
        Self {
            tag: tag.into(),
            ordinal: ordinal as i64,
        }
    }

    /// Parse an id as sent back by the runner: `[<tag>, <ordinal>]`
    ///
    /// The ordinal may arrive as a number or as a numeric string.
    pub fn from_value(value: &Value) -> Result<Self> {
        let tag = value
            .get(0)
            .and_then(Value::as_str)
            .ok_or(Error::MalformedStepId)?;
        let ordinal = value
            .get(1)
            .and_then(integer_value)
            .ok_or(Error::MalformedStepId)?;

        Ok(Self {
            tag: tag.to_string(),
            ordinal,
        })
    }

    pub fn to_value(&self) -> Value {
        json!([self.tag, self.ordinal])
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.tag, self.ordinal)
    }
}

/// Read an integer from a JSON number (rounded to nearest) or a numeric string
pub fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| (f + 0.5).floor() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A request from the test runner
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Find the step whose pattern matches the given text
    StepMatches { name_to_match: String },
    /// Run a previously matched step
    Invoke { id: StepId, args: Value },
    /// Start a scenario, instantiating the modules named by `tags`
    BeginScenario { tags: Vec<String> },
    /// Tear down the current scenario
    EndScenario,
    /// Any verb this server has no handler for
    Other { verb: String, body: Option<Value> },
}

impl Request {
    /// Decode a request from its JSON value
    pub fn from_value(value: &Value) -> Result<Self> {
        let verb = value
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedCommand("missing verb".to_string()))?;
        let body = value.get(1);

        match verb {
            "step_matches" => {
                let name_to_match = body
                    .and_then(|b| b.get("name_to_match"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::MalformedCommand("step_matches needs name_to_match".to_string())
                    })?;
                Ok(Request::StepMatches {
                    name_to_match: name_to_match.to_string(),
                })
            }
            "invoke" => {
                let id = body
                    .and_then(|b| b.get("id"))
                    .ok_or(Error::MalformedStepId)
                    .and_then(StepId::from_value)?;
                let args = body
                    .and_then(|b| b.get("args"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Request::Invoke { id, args })
            }
            "begin_scenario" => {
                // Missing or non-array tags are valid: nothing gets loaded
                let tags = body
                    .and_then(|b| b.get("tags"))
                    .and_then(Value::as_array)
                    .map(|tags| {
                        tags.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Request::BeginScenario { tags })
            }
            "end_scenario" => Ok(Request::EndScenario),
            other => Ok(Request::Other {
                verb: other.to_string(),
                body: body.cloned(),
            }),
        }
    }

    /// Encode the request as its JSON value
    pub fn to_value(&self) -> Value {
        match self {
            Request::StepMatches { name_to_match } => {
                json!(["step_matches", { "name_to_match": name_to_match }])
            }
            Request::Invoke { id, args } => {
                json!(["invoke", { "id": id.to_value(), "args": args }])
            }
            Request::BeginScenario { tags } => json!(["begin_scenario", { "tags": tags }]),
            Request::EndScenario => json!(["end_scenario"]),
            Request::Other { verb, body } => match body {
                Some(body) => json!([verb, body]),
                None => json!([verb]),
            },
        }
    }

    /// Verb name, for logging
    pub fn verb(&self) -> &str {
        match self {
            Request::StepMatches { .. } => "step_matches",
            Request::Invoke { .. } => "invoke",
            Request::BeginScenario { .. } => "begin_scenario",
            Request::EndScenario => "end_scenario",
            Request::Other { verb, .. } => verb,
        }
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Request::from_value(&value).map_err(D::Error::custom)
    }
}

/// One captured group of a step match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchArg {
    /// Captured text
    pub val: String,
    /// Byte offset of the capture in the matched text, -1 if the group did not participate
    pub pos: i64,
}

/// A successful step match, as reported to the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMatch {
    pub id: StepId,
    pub args: Vec<MatchArg>,
}

impl StepMatch {
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id.to_value(),
            "args": self.args,
            "source": self.id.tag,
        })
    }
}

/// A reply to the test runner
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `["success"]` or `["success", payload]`
    Success(Option<Value>),
    /// `["fail"]` or `["fail", {"message", "exception"}]`
    Fail(Option<WireError>),
}

impl Reply {
    /// Plain acknowledgement
    pub fn ok() -> Self {
        Reply::Success(None)
    }

    /// Answer to `step_matches`; an empty list means no step matched
    pub fn matches(found: Option<StepMatch>) -> Self {
        let list: Vec<Value> = found.iter().map(StepMatch::to_value).collect();
        Reply::Success(Some(Value::Array(list)))
    }

    /// Failure carrying the error's message and exception tag
    pub fn error(error: &Error) -> Self {
        Reply::Fail(Some(WireError::from(error)))
    }

    /// Bare failure used for structurally malformed commands
    pub fn malformed() -> Self {
        Reply::Fail(None)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success(_))
    }

    /// Failure message, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            Reply::Fail(Some(err)) => Some(&err.message),
            _ => None,
        }
    }

    /// Encode the reply as its JSON value
    pub fn to_value(&self) -> Value {
        match self {
            Reply::Success(None) => json!(["success"]),
            Reply::Success(Some(payload)) => json!(["success", payload]),
            Reply::Fail(None) => json!(["fail"]),
            Reply::Fail(Some(err)) => json!(["fail", err]),
        }
    }

    /// Decode a reply from its JSON value
    pub fn from_value(value: &Value) -> Result<Self> {
        let outcome = value
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedCommand("reply without outcome".to_string()))?;
        let payload = value.get(1).cloned();

        match outcome {
            "success" => Ok(Reply::Success(payload)),
            "fail" => {
                let err = payload.map(serde_json::from_value).transpose()?;
                Ok(Reply::Fail(err))
            }
            other => Err(Error::MalformedCommand(format!(
                "unknown reply outcome '{}'",
                other
            ))),
        }
    }
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Reply {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Reply::from_value(&value).map_err(D::Error::custom)
    }
}
