//! Self-test steps for exercising a runner against the server

use std::time::Duration;

use crate::common::{Error, Result};

use super::args::StepArgs;
use super::correlator::{Correlator, Verdict};
use super::registry::{ScenarioState, Step, StepModule};

pub const TAG: &str = "test";

/// Counts the steps run in one scenario
#[derive(Debug, Default)]
pub struct TestState {
    steps: u64,
}

impl ScenarioState for TestState {
    type Watch = ();
}

pub fn module() -> StepModule<TestState> {
    StepModule::new(TAG, |_| {
        tracing::debug!("test scenario started");
        TestState::default()
    })
    .on_end(|state| tracing::debug!(steps = state.steps, "test scenario finished"))
    .step("^I fail$", fail)
    .step("^I succeed$", succeed)
    .step("^I do (.*) stuff$", do_stuff)
    .step("^I do (.*) stuff (.*)$", do_stuff)
    .step("^I wait ([0-9]+) ms$", wait)
    .step("^I time out after ([0-9]+) ms$", time_out)
}

fn fail(state: &mut TestState, _: &mut Correlator<()>, _: &StepArgs) -> Result<Step> {
    state.steps += 1;
    Err(Error::StepError)
}

fn succeed(state: &mut TestState, _: &mut Correlator<()>, _: &StepArgs) -> Result<Step> {
    state.steps += 1;
    Ok(Step::Done)
}

fn do_stuff(state: &mut TestState, _: &mut Correlator<()>, args: &StepArgs) -> Result<Step> {
    state.steps += 1;
    for index in 0..args.len() {
        if let Ok(value) = args.string(index) {
            tracing::info!(index, value, "Doing stuff");
        }
    }
    Ok(Step::Done)
}

fn wait(state: &mut TestState, corr: &mut Correlator<()>, args: &StepArgs) -> Result<Step> {
    state.steps += 1;
    let ms = millis(args)?;
    corr.arm((), Duration::from_millis(ms), Verdict::Pass)?;
    Ok(Step::Deferred)
}

fn time_out(state: &mut TestState, corr: &mut Correlator<()>, args: &StepArgs) -> Result<Step> {
    state.steps += 1;
    let ms = millis(args)?;
    corr.arm((), Duration::from_millis(ms), Verdict::fail("Timed out"))?;
    Ok(Step::Deferred)
}

fn millis(args: &StepArgs) -> Result<u64> {
    let ms = args.integer(0)?;
    u64::try_from(ms).map_err(|_| Error::argument(0, "negative duration"))
}
