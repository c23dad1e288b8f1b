//! Command handler for wire protocol requests
//!
//! Turns one decoded frame into either an immediate reply or a note that the
//! reply is owed by a deferred step.

use serde_json::Value;

use crate::common::error::WireError;
use crate::common::{Error, Result};
use crate::steps::{Step, StepArgs, Verdict};
use crate::wire::{Reply, Request};

use super::session::{ScenarioSession, SessionFactory};

/// What the connection should do after a command
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Send this reply now
    Reply(Reply),
    /// The step armed a wait; reply once the instance for `tag` resolves
    Deferred { tag: String },
}

/// Handle one raw frame
pub fn handle_frame(
    session: &mut Option<ScenarioSession>,
    factory: &mut SessionFactory,
    frame: &[u8],
) -> Dispatch {
    let request = serde_json::from_slice::<Value>(frame)
        .map_err(Error::from)
        .and_then(|value| Request::from_value(&value));

    match request {
        Ok(request) => handle_command(session, factory, request),
        // A bad id is reported like any routing error
        Err(e @ Error::MalformedStepId) => Dispatch::Reply(Reply::error(&e)),
        Err(e) => {
            tracing::debug!("Rejecting malformed command: {}", e);
            Dispatch::Reply(Reply::malformed())
        }
    }
}

/// Handle a decoded request
pub fn handle_command(
    session: &mut Option<ScenarioSession>,
    factory: &mut SessionFactory,
    request: Request,
) -> Dispatch {
    let verb = request.verb().to_string();
    match handle_command_inner(session, factory, request) {
        Ok(dispatch) => dispatch,
        Err(e) => {
            tracing::debug!(verb = %verb, "Command failed: {}", e);
            Dispatch::Reply(Reply::error(&e))
        }
    }
}

fn handle_command_inner(
    session: &mut Option<ScenarioSession>,
    factory: &mut SessionFactory,
    request: Request,
) -> Result<Dispatch> {
    match request {
        Request::StepMatches { name_to_match } => {
            let found = factory.context().registry.find(&name_to_match);
            match &found {
                Some(m) => tracing::debug!(text = %name_to_match, step = %m.id, "Step matched"),
                None => tracing::debug!(text = %name_to_match, "No step matched"),
            }
            Ok(Dispatch::Reply(Reply::matches(found)))
        }

        Request::Invoke { id, args } => {
            let sess = session.as_mut().ok_or(Error::ScenarioNotActive)?;
            match sess.invoke(&id, &StepArgs::from_value(args))? {
                Step::Done => Ok(Dispatch::Reply(Reply::ok())),
                Step::Deferred => {
                    tracing::debug!(step = %id, "Step deferred");
                    Ok(Dispatch::Deferred { tag: id.tag })
                }
            }
        }

        Request::BeginScenario { tags } => {
            // A scenario that was never ended is torn down first
            if let Some(previous) = session.take() {
                previous.end();
            }
            *session = Some(factory.begin(&tags));
            Ok(Dispatch::Reply(Reply::ok()))
        }

        Request::EndScenario => {
            let sess = session.take().ok_or(Error::ScenarioNotActive)?;
            sess.end();
            Ok(Dispatch::Reply(Reply::ok()))
        }

        Request::Other { verb, .. } => {
            tracing::debug!(verb = %verb, "Acknowledging unhandled verb");
            Ok(Dispatch::Reply(Reply::ok()))
        }
    }
}

/// Reply for a resolved deferred step
pub fn verdict_reply(verdict: Verdict) -> Reply {
    match verdict {
        Verdict::Pass => Reply::ok(),
        Verdict::Fail(message) => Reply::Fail(Some(WireError::execution(message))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TextEventCodec;
    use crate::common::config::Timeouts;
    use crate::common::error::{EXCEPTION_EXECUTION, EXCEPTION_INTERNAL};
    use crate::server::ServerContext;
    use crate::steps;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn factory() -> SessionFactory {
        let context = ServerContext::new(
            steps::builtin().unwrap(),
            Arc::new(TextEventCodec),
            Timeouts::default(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionFactory::new(Arc::new(context), tx)
    }

    fn run(
        session: &mut Option<ScenarioSession>,
        factory: &mut SessionFactory,
        frame: &str,
    ) -> Dispatch {
        handle_frame(session, factory, frame.as_bytes())
    }

    fn reply(dispatch: Dispatch) -> Value {
        match dispatch {
            Dispatch::Reply(reply) => reply.to_value(),
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_step_matches() {
        let mut factory = factory();
        let mut session = None;

        let found = reply(run(
            &mut session,
            &mut factory,
            r#"["step_matches",{"name_to_match":"I do great stuff"}]"#,
        ));
        assert_eq!(
            found,
            json!(["success", [{
                "id": ["test", 2],
                "args": [{"val": "great", "pos": 5}],
                "source": "test"
            }]])
        );

        let none = reply(run(
            &mut session,
            &mut factory,
            r#"["step_matches",{"name_to_match":"unmatched text"}]"#,
        ));
        assert_eq!(none, json!(["success", []]));
    }

    #[tokio::test]
    async fn test_invoke_requires_scenario() {
        let mut factory = factory();
        let mut session = None;

        let value = reply(run(
            &mut session,
            &mut factory,
            r#"["invoke",{"id":["test",1],"args":[]}]"#,
        ));
        assert_eq!(value[0], "fail");
        assert_eq!(value[1]["exception"], EXCEPTION_INTERNAL);

        let value = reply(run(&mut session, &mut factory, r#"["end_scenario"]"#));
        assert_eq!(value[0], "fail");
    }

    #[tokio::test]
    async fn test_scenario_flow() {
        let mut factory = factory();
        let mut session = None;

        let begin = r#"["begin_scenario",{"tags":["test"]}]"#;
        assert_eq!(
            reply(run(&mut session, &mut factory, begin)),
            json!(["success"])
        );

        let value = reply(run(
            &mut session,
            &mut factory,
            r#"["invoke",{"id":["test",1],"args":[]}]"#,
        ));
        assert_eq!(value, json!(["success"]));

        let value = reply(run(
            &mut session,
            &mut factory,
            r#"["invoke",{"id":["test",0],"args":[]}]"#,
        ));
        assert_eq!(
            value,
            json!(["fail", {"message": "Step error", "exception": EXCEPTION_EXECUTION}])
        );

        let value = reply(run(
            &mut session,
            &mut factory,
            r#"["invoke",{"id":["merlin",0],"args":["a","1"]}]"#,
        ));
        assert_eq!(value[1]["message"], "Unknown step definition id");
        assert_eq!(value[1]["exception"], EXCEPTION_INTERNAL);

        let deferred = run(
            &mut session,
            &mut factory,
            r#"["invoke",{"id":["test",4],"args":["10"]}]"#,
        );
        assert_eq!(
            deferred,
            Dispatch::Deferred {
                tag: "test".to_string()
            }
        );

        assert_eq!(
            reply(run(&mut session, &mut factory, r#"["end_scenario"]"#)),
            json!(["success"])
        );
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_verbs() {
        let mut factory = factory();
        let mut session = None;

        for frame in ["", "  ", "not json", "{}", "[]", r#"["step_matches"]"#] {
            assert_eq!(
                reply(run(&mut session, &mut factory, frame)),
                json!(["fail"])
            );
        }

        let value = reply(run(
            &mut session,
            &mut factory,
            r#"["invoke",{"id":"test"}]"#,
        ));
        assert_eq!(
            value,
            json!(["fail", {"message": "Malformed id tag", "exception": EXCEPTION_INTERNAL}])
        );

        assert_eq!(
            reply(run(
                &mut session,
                &mut factory,
                r#"["snippet_text",{"step_keyword":"Given"}]"#
            )),
            json!(["success"])
        );
    }

    #[test]
    fn test_verdict_reply() {
        assert_eq!(verdict_reply(Verdict::Pass), Reply::ok());
        assert_eq!(
            verdict_reply(Verdict::fail("Not connected")).to_value(),
            json!(["fail", {"message": "Not connected", "exception": EXCEPTION_EXECUTION}])
        );
    }
}
