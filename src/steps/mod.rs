//! Step modules, the registry that matches step text, and the correlator
//! that lets a step wait for broker traffic

pub mod args;
pub mod context;
pub mod correlator;
pub mod merlin;
pub mod registry;
pub mod test_steps;

pub use args::StepArgs;
pub use context::ScenarioContext;
pub use correlator::{Correlator, Verdict};
pub use registry::{HandlerInstance, ScenarioState, Step, StepEnvironment, StepModule, StepRegistry};

use crate::common::Result;

/// Registry holding every built-in step module
pub fn builtin() -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();
    registry.register(test_steps::module())?;
    registry.register(merlin::module())?;
    Ok(registry)
}
