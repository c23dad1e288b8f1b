//! Scenario session: the live handler instances of one connection
//!
//! A session exists between `begin_scenario` and `end_scenario` (or the loss
//! of the connection). It owns one handler instance per requested module
//! tag. Dropping the session ends every instance, which stops any armed
//! assertion before the instance state and its links are released.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broker::{PeerMessage, Route};
use crate::common::{Error, Result};
use crate::steps::{HandlerInstance, ScenarioContext, Step, StepArgs, Verdict};
use crate::wire::StepId;

use super::ServerContext;

/// Creates sessions for one connection
///
/// Each session gets a fresh generation number, so link traffic from an
/// earlier scenario on the same connection can be told apart.
pub struct SessionFactory {
    context: Arc<ServerContext>,
    peers: mpsc::UnboundedSender<PeerMessage>,
    generation: u64,
}

impl SessionFactory {
    pub fn new(context: Arc<ServerContext>, peers: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self {
            context,
            peers,
            generation: 0,
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Start a scenario with instances for every known tag in `tags`
    pub fn begin(&mut self, tags: &[String]) -> ScenarioSession {
        self.generation += 1;
        let mut instances: HashMap<String, Box<dyn HandlerInstance>> = HashMap::new();

        for tag in tags {
            if instances.contains_key(tag) {
                continue;
            }
            let Some(module) = self.context.registry.module(tag) else {
                tracing::debug!(tag = %tag, "Ignoring unknown scenario tag");
                continue;
            };

            let scenario = ScenarioContext::new(
                Route {
                    tag: tag.clone(),
                    generation: self.generation,
                },
                self.peers.clone(),
                self.context.timeouts.clone(),
                self.context.codec.clone(),
            );
            instances.insert(tag.clone(), Arc::clone(module).begin(&scenario));
        }

        tracing::info!(
            generation = self.generation,
            modules = ?instances.keys().collect::<Vec<_>>(),
            "Scenario started"
        );

        ScenarioSession {
            generation: self.generation,
            instances,
        }
    }
}

/// Handler instances of the running scenario, keyed by module tag
pub struct ScenarioSession {
    generation: u64,
    instances: HashMap<String, Box<dyn HandlerInstance>>,
}

impl ScenarioSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Route an `invoke` to the instance owning `id`
    pub fn invoke(&mut self, id: &StepId, args: &StepArgs) -> Result<Step> {
        let unknown = || {
            tracing::debug!(step = %id, "No live step definition for id");
            Error::UnknownStep {
                tag: id.tag.clone(),
                ordinal: id.ordinal,
            }
        };
        let instance = self.instances.get_mut(&id.tag).ok_or_else(unknown)?;
        let ordinal = usize::try_from(id.ordinal).map_err(|_| unknown())?;

        tracing::debug!(step = %id, "Invoking step");
        instance.invoke(ordinal, args)
    }

    /// Hand a link notification to its instance, dropping stale traffic
    pub fn deliver(&mut self, message: PeerMessage) {
        if message.route.generation != self.generation {
            tracing::trace!(
                link = %message.link,
                generation = message.route.generation,
                "Dropping notification from an ended scenario"
            );
            return;
        }
        if let Some(instance) = self.instances.get_mut(&message.route.tag) {
            instance.deliver(message);
        }
    }

    /// Earliest deadline of any armed assertion
    pub fn next_deadline(&self) -> Option<Instant> {
        self.instances.values().filter_map(|i| i.deadline()).min()
    }

    /// Let every passed deadline fire
    pub fn expire(&mut self, now: Instant) {
        for instance in self.instances.values_mut() {
            instance.expire(now);
        }
    }

    /// Take the verdict of the instance owning `tag`, if it has resolved
    pub fn take_verdict(&mut self, tag: &str) -> Option<Verdict> {
        self.instances.get_mut(tag)?.take_verdict()
    }

    /// End the scenario, running every end hook
    pub fn end(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.instances.is_empty() {
            return;
        }
        for (tag, mut instance) in self.instances.drain() {
            if let Some(verdict) = instance.end() {
                tracing::debug!(tag = %tag, ?verdict, "Stopped pending step");
            }
        }
        tracing::info!(generation = self.generation, "Scenario ended");
    }
}

impl Drop for ScenarioSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
