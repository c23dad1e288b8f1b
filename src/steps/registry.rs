//! Step modules and the process-wide step registry
//!
//! A [`StepModule`] is a tag, an optional pair of scenario hooks and an
//! ordered list of `(pattern, handler)` definitions over one state type.
//! Registering it compiles every pattern once and appends the compiled steps
//! to a flat index, so `step_matches` is a single linear scan across all
//! modules in registration order. The `(tag, ordinal)` pair handed out for a
//! match stays valid for the process lifetime.
//!
//! Handlers are plain functions over typed module state. The registry and
//! the scenario session only ever see them through the object-safe
//! [`StepEnvironment`] and [`HandlerInstance`] traits.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tokio::time::Instant;

use crate::broker::PeerMessage;
use crate::common::{Error, Result};
use crate::wire::protocol::{MatchArg, StepId, StepMatch};

use super::args::StepArgs;
use super::context::ScenarioContext;
use super::correlator::{Correlator, Verdict};

/// How a step finished its synchronous part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The step completed successfully
    Done,
    /// The step armed its correlator; the reply waits for the verdict
    Deferred,
}

/// Per-scenario state of one step module
pub trait ScenarioState: Send + 'static {
    /// Condition a deferred step waits for
    type Watch: Send + 'static;

    /// React to a link notification, possibly resolving the armed watch
    fn on_link_event(&mut self, _correlator: &mut Correlator<Self::Watch>, _message: PeerMessage) {}
}

impl ScenarioState for () {
    type Watch = ();
}

/// Step handler over typed module state
pub type StepHandler<S> =
    fn(&mut S, &mut Correlator<<S as ScenarioState>::Watch>, &StepArgs) -> Result<Step>;

struct StepDefinition<S: ScenarioState> {
    pattern: String,
    handler: StepHandler<S>,
}

/// A named group of step definitions sharing one scenario state
pub struct StepModule<S: ScenarioState> {
    tag: String,
    begin: fn(&ScenarioContext) -> S,
    end: Option<fn(&mut S)>,
    definitions: Vec<StepDefinition<S>>,
}

impl<S: ScenarioState> StepModule<S> {
    /// Module whose state is built by `begin` at the start of each scenario
    pub fn new(tag: impl Into<String>, begin: fn(&ScenarioContext) -> S) -> Self {
        Self {
            tag: tag.into(),
            begin,
            end: None,
            definitions: Vec::new(),
        }
    }

    /// Hook run on the state when the scenario ends
    pub fn on_end(mut self, end: fn(&mut S)) -> Self {
        self.end = Some(end);
        self
    }

    /// Append a step definition; its ordinal is its position in the module
    pub fn step(mut self, pattern: &str, handler: StepHandler<S>) -> Self {
        self.definitions.push(StepDefinition {
            pattern: pattern.to_string(),
            handler,
        });
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl StepModule<()> {
    /// Module without scenario state
    pub fn stateless(tag: impl Into<String>) -> Self {
        Self::new(tag, |_| ())
    }
}

/// Type-erased view of a registered module
pub trait StepEnvironment: Send + Sync {
    fn tag(&self) -> &str;

    /// Patterns in ordinal order
    fn patterns(&self) -> Vec<&str>;

    /// Build a live instance for one scenario
    fn begin(self: Arc<Self>, context: &ScenarioContext) -> Box<dyn HandlerInstance>;
}

impl<S: ScenarioState> StepEnvironment for StepModule<S> {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn patterns(&self) -> Vec<&str> {
        self.definitions.iter().map(|d| d.pattern.as_str()).collect()
    }

    fn begin(self: Arc<Self>, context: &ScenarioContext) -> Box<dyn HandlerInstance> {
        let state = (self.begin)(context);
        Box::new(Instance {
            module: self,
            state,
            correlator: Correlator::new(),
        })
    }
}

/// A module's live state for the current scenario
pub trait HandlerInstance: Send {
    fn tag(&self) -> &str;

    /// Run the step at `ordinal`
    fn invoke(&mut self, ordinal: usize, args: &StepArgs) -> Result<Step>;

    /// Feed a link notification routed to this instance
    fn deliver(&mut self, message: PeerMessage);

    /// Deadline of the armed assertion, if any
    fn deadline(&self) -> Option<Instant>;

    /// Apply the timeout verdict if the deadline has passed
    fn expire(&mut self, now: Instant);

    /// Take the verdict of a resolved assertion
    fn take_verdict(&mut self) -> Option<Verdict>;

    /// Stop any armed assertion and run the end hook
    ///
    /// Returns the "stopped" verdict if an assertion was still armed.
    fn end(&mut self) -> Option<Verdict>;
}

struct Instance<S: ScenarioState> {
    module: Arc<StepModule<S>>,
    state: S,
    correlator: Correlator<S::Watch>,
}

impl<S: ScenarioState> HandlerInstance for Instance<S> {
    fn tag(&self) -> &str {
        &self.module.tag
    }

    fn invoke(&mut self, ordinal: usize, args: &StepArgs) -> Result<Step> {
        let definition = self
            .module
            .definitions
            .get(ordinal)
            .ok_or_else(|| {
                tracing::debug!(tag = %self.module.tag, ordinal, "Step ordinal out of range");
                Error::UnknownStep {
                    tag: self.module.tag.clone(),
                    ordinal: ordinal as i64,
                }
            })?;

        if !self.correlator.is_idle() {
            return Err(Error::AssertionPending);
        }

        let result = (definition.handler)(&mut self.state, &mut self.correlator, args);
        match (result, self.correlator.is_armed()) {
            (Ok(Step::Deferred), true) => Ok(Step::Deferred),
            (Ok(Step::Done), false) => Ok(Step::Done),
            (Err(e), false) => Err(e),
            (result, _) => {
                // Handler and correlator disagree; never leave a wait behind
                self.correlator.stop();
                self.correlator.take_verdict();
                match result {
                    Err(e) => Err(e),
                    Ok(step) => Err(Error::Internal(format!(
                        "Step '{}' returned {:?} with inconsistent correlator state",
                        definition.pattern, step
                    ))),
                }
            }
        }
    }

    fn deliver(&mut self, message: PeerMessage) {
        self.state.on_link_event(&mut self.correlator, message);
    }

    fn deadline(&self) -> Option<Instant> {
        self.correlator.deadline()
    }

    fn expire(&mut self, now: Instant) {
        self.correlator.expire(now);
    }

    fn take_verdict(&mut self) -> Option<Verdict> {
        self.correlator.take_verdict()
    }

    fn end(&mut self) -> Option<Verdict> {
        let stopped = self.correlator.stop().then(|| self.correlator.take_verdict());
        if let Some(end) = self.module.end {
            end(&mut self.state);
        }
        stopped.flatten()
    }
}

/// Anything that can match free step text and report its captures
pub trait StepMatcher: Send + Sync {
    fn pattern(&self) -> &str;

    /// Captured groups of every match in order, or `None` if `text` does not match
    fn captures(&self, text: &str) -> Option<Vec<MatchArg>>;
}

/// [`StepMatcher`] backed by a compiled regular expression
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    regex: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| Error::invalid_pattern(pattern, e))?;
        Ok(Self { regex })
    }
}

impl StepMatcher for RegexMatcher {
    fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    fn captures(&self, text: &str) -> Option<Vec<MatchArg>> {
        let mut found = false;
        let mut args = Vec::new();

        for caps in self.regex.captures_iter(text) {
            found = true;
            for group in caps.iter().skip(1) {
                args.push(match group {
                    Some(m) => MatchArg {
                        val: m.as_str().to_string(),
                        pos: m.start() as i64,
                    },
                    None => MatchArg {
                        val: String::new(),
                        pos: -1,
                    },
                });
            }
        }

        found.then_some(args)
    }
}

struct CompiledStep {
    id: StepId,
    matcher: Box<dyn StepMatcher>,
}

/// All registered modules plus the flat compiled step index
#[derive(Default)]
pub struct StepRegistry {
    modules: HashMap<String, Arc<dyn StepEnvironment>>,
    steps: Vec<CompiledStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, compiling its patterns in declaration order
    ///
    /// Nothing is registered if any pattern fails to compile.
    pub fn register<S: ScenarioState>(&mut self, module: StepModule<S>) -> Result<()> {
        if self.modules.contains_key(&module.tag) {
            return Err(Error::DuplicateModule(module.tag));
        }

        let compiled = module
            .definitions
            .iter()
            .enumerate()
            .map(|(ordinal, def)| {
                Ok(CompiledStep {
                    id: StepId::new(&module.tag, ordinal),
                    matcher: Box::new(RegexMatcher::new(&def.pattern)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            tag = %module.tag,
            steps = compiled.len(),
            "Registered step module"
        );
        self.steps.extend(compiled);
        self.modules.insert(module.tag.clone(), Arc::new(module));
        Ok(())
    }

    /// First step, across all modules, whose pattern matches `text`
    pub fn find(&self, text: &str) -> Option<StepMatch> {
        self.steps.iter().find_map(|step| {
            step.matcher.captures(text).map(|args| StepMatch {
                id: step.id.clone(),
                args,
            })
        })
    }

    pub fn module(&self, tag: &str) -> Option<&Arc<dyn StepEnvironment>> {
        self.modules.get(tag)
    }

    /// Every compiled step with its pattern, in matching order
    pub fn steps(&self) -> impl Iterator<Item = (&StepId, &str)> {
        self.steps.iter().map(|s| (&s.id, s.matcher.pattern()))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
