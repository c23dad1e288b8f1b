//! Runner-side client for talking to a step server
//!
//! Used by the `match` CLI command and by the end-to-end tests.

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::ToSocketAddrs;

use crate::common::{Error, Result};

use super::protocol::{Reply, Request, StepId, StepMatch};
use super::transport::{self, DEFAULT_MAX_FRAME};

/// Client for the step server wire protocol
pub struct WireClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl WireClient {
    /// Connect to a running step server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = transport::connect(addr).await?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send a request and wait for its reply
    pub async fn send(&mut self, request: &Request) -> Result<Reply> {
        self.send_value(&request.to_value()).await
    }

    /// Send an arbitrary JSON value and wait for the reply
    pub async fn send_value(&mut self, value: &Value) -> Result<Reply> {
        transport::send_message(&mut self.writer, value).await?;
        self.recv().await
    }

    /// Wait for the next reply without sending anything
    pub async fn recv(&mut self) -> Result<Reply> {
        transport::recv_message(&mut self.reader, DEFAULT_MAX_FRAME).await
    }

    /// Ask which step matches `text`
    pub async fn step_matches(&mut self, text: &str) -> Result<Option<StepMatch>> {
        let reply = self
            .send(&Request::StepMatches {
                name_to_match: text.to_string(),
            })
            .await?;

        let payload = match reply {
            Reply::Success(Some(payload)) => payload,
            Reply::Success(None) => return Ok(None),
            Reply::Fail(err) => {
                return Err(Error::MalformedCommand(
                    err.map(|e| e.message)
                        .unwrap_or_else(|| "step_matches rejected".to_string()),
                ))
            }
        };

        let Some(first) = payload.as_array().and_then(|list| list.first()) else {
            return Ok(None);
        };
        let id = first
            .get("id")
            .ok_or(Error::MalformedStepId)
            .and_then(StepId::from_value)?;
        let args = match first.get("args") {
            Some(args) => serde_json::from_value(args.clone())?,
            None => Vec::new(),
        };

        Ok(Some(StepMatch { id, args }))
    }

    /// Invoke a step by id
    pub async fn invoke(&mut self, id: &StepId, args: Value) -> Result<Reply> {
        self.send(&Request::Invoke {
            id: id.clone(),
            args,
        })
        .await
    }

    /// Match `text` and invoke the resulting step with `args`
    pub async fn run_step(&mut self, text: &str, args: Value) -> Result<Reply> {
        let found = self
            .step_matches(text)
            .await?
            .ok_or_else(|| Error::Internal(format!("No step matches '{}'", text)))?;
        self.invoke(&found.id, args).await
    }

    /// Start a scenario with the given module tags
    pub async fn begin_scenario(&mut self, tags: &[&str]) -> Result<Reply> {
        self.send(&Request::BeginScenario {
            tags: tags.iter().map(|t| t.to_string()).collect(),
        })
        .await
    }

    /// End the current scenario
    pub async fn end_scenario(&mut self) -> Result<Reply> {
        self.send(&Request::EndScenario).await
    }
}
