//! Steps that talk to the event broker under test
//!
//! Every scenario gets a table of named links. A link is opened in client or
//! server role, over TCP or a unix socket, and keeps a connected flag plus an
//! append-only buffer of the events received on it. Assertions first look at
//! what is already known and only arm the correlator when the answer has to
//! come from future link traffic.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::broker::{
    is_event_type, Endpoint, EventRecord, Link, LinkEvent, LinkSpec, MatchCriteria, PeerMessage,
    Role,
};
use crate::common::{Error, Result};

use super::args::StepArgs;
use super::context::ScenarioContext;
use super::correlator::{Correlator, Verdict};
use super::registry::{ScenarioState, Step, StepModule};

pub const TAG: &str = "merlin";

/// Link lifecycle as seen by the steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Opened, not connected yet
    Pending,
    Connected,
    /// Closed, failed or disconnected; never comes back
    Closed,
}

/// Whether a watched event should show up or stay away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Eventually,
    Never,
}

/// What a deferred merlin step is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watch {
    Connected { link: String },
    Disconnected { link: String },
    Event {
        link: String,
        criteria: MatchCriteria,
        expect: Expectation,
    },
}

#[derive(Debug)]
struct Connection {
    link: Option<Link>,
    id: u64,
    state: LinkState,
    buffer: Vec<EventRecord>,
    /// Released by a disconnect step
    disconnected: bool,
}

/// Links owned by one scenario
#[derive(Debug)]
pub struct MerlinState {
    context: ScenarioContext,
    connections: HashMap<String, Connection>,
}

impl MerlinState {
    pub fn new(context: &ScenarioContext) -> Self {
        Self {
            context: context.clone(),
            connections: HashMap::new(),
        }
    }

    /// Open a link, closing any previous link with the same name
    fn open(&mut self, name: &str, spec: LinkSpec) {
        tracing::info!(link = name, %spec, "Opening merlin link");
        let link = self.context.open_link(name, spec);
        let previous = self.connections.insert(
            name.to_string(),
            Connection {
                id: link.id(),
                link: Some(link),
                state: LinkState::Pending,
                buffer: Vec::new(),
                disconnected: false,
            },
        );
        if previous.is_some() {
            tracing::debug!(link = name, "Replaced existing link");
        }
    }

    fn connection(&self, name: &str) -> Result<&Connection> {
        self.connections
            .get(name)
            .ok_or_else(|| Error::UnknownLink(name.to_string()))
    }

    fn connection_mut(&mut self, name: &str) -> Result<&mut Connection> {
        self.connections
            .get_mut(name)
            .ok_or_else(|| Error::UnknownLink(name.to_string()))
    }

    /// Current state of the named link
    pub fn link_state(&self, name: &str) -> Option<LinkState> {
        self.connections.get(name).map(|c| c.state)
    }

    /// Events buffered on the named link
    pub fn buffered(&self, name: &str) -> &[EventRecord] {
        self.connections
            .get(name)
            .map(|c| c.buffer.as_slice())
            .unwrap_or_default()
    }

    fn close_all(&mut self) {
        for (name, connection) in self.connections.iter_mut() {
            if connection.link.take().is_some() {
                tracing::debug!(link = %name, "Closing merlin link");
            }
            connection.state = LinkState::Closed;
        }
    }
}

impl ScenarioState for MerlinState {
    type Watch = Watch;

    fn on_link_event(&mut self, corr: &mut Correlator<Watch>, message: PeerMessage) {
        let Some(connection) = self.connections.get_mut(&message.link) else {
            return;
        };
        if connection.id != message.link_id || connection.link.is_none() {
            tracing::trace!(link = %message.link, "Dropping notification from a replaced link");
            return;
        }
        let name = message.link;

        match message.event {
            LinkEvent::Connected => {
                tracing::info!(link = %name, "Merlin link connected");
                connection.state = LinkState::Connected;
                corr.resolve_with(|watch| match watch {
                    Watch::Connected { link } if *link == name => Some(Verdict::Pass),
                    _ => None,
                });
            }
            LinkEvent::Event(event) => {
                tracing::debug!(link = %name, %event, "Merlin event received");
                corr.resolve_with(|watch| match watch {
                    Watch::Event {
                        link,
                        criteria,
                        expect,
                    } if *link == name && criteria.matches(&event) => Some(match expect {
                        Expectation::Eventually => Verdict::Pass,
                        Expectation::Never => Verdict::Fail(unexpected(&criteria.event_type)),
                    }),
                    _ => None,
                });
                connection.buffer.push(event);
            }
            LinkEvent::Failed(reason) => {
                tracing::warn!(link = %name, "Merlin link failed: {}", reason);
            }
            LinkEvent::Closed => {
                tracing::info!(link = %name, "Merlin link closed");
                connection.state = LinkState::Closed;
                connection.link = None;
                corr.resolve_with(|watch| match watch {
                    Watch::Disconnected { link } if *link == name => Some(Verdict::Pass),
                    _ => None,
                });
            }
        }
    }
}

pub fn module() -> StepModule<MerlinState> {
    StepModule::new(TAG, MerlinState::new)
        .on_end(MerlinState::close_all)
        .step(
            "^([a-z0-9_-]+) connect to merlin at port ([0-9]+)$",
            connect_tcp,
        )
        .step(
            "^([a-z0-9_-]+) connect to merlin at port ([0-9]+) from port ([0-9]+)$",
            connect_tcp_from,
        )
        .step(
            "^([a-z0-9_-]+) connect to merlin at socket (.*)$",
            connect_unix,
        )
        .step(
            "^([a-z0-9_-]+) listens for merlin at port ([0-9]+)$",
            listen_tcp,
        )
        .step(
            "^([a-z0-9_-]+) listens for merlin at socket (.*)$",
            listen_unix,
        )
        .step("^([a-z0-9_-]+) disconnects from merlin$", disconnect)
        .step("^([a-z0-9_-]+) is connected to merlin$", is_connected)
        .step("^([a-z0-9_-]+) is disconnected from merlin$", is_disconnected)
        .step("^([a-z0-9_-]+) sends raw event ([A-Z_]+)$", send_event)
        .step("^([a-z0-9_-]+) clears buffer$", clear_buffer)
        .step("^([a-z0-9_-]+) received event ([A-Z_]+)$", received_event)
        .step(
            "^([a-z0-9_-]+) should not receive event ([A-Z_]+)$",
            not_received_event,
        )
}

type Corr = Correlator<Watch>;

fn connect_tcp(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let port = args.port(1)?;
    state.open(
        name,
        LinkSpec {
            role: Role::Connect,
            endpoint: Endpoint::Tcp {
                port,
                source_port: None,
            },
        },
    );
    Ok(Step::Done)
}

fn connect_tcp_from(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let port = args.port(1)?;
    let source_port = args.port(2)?;
    state.open(
        name,
        LinkSpec {
            role: Role::Connect,
            endpoint: Endpoint::Tcp {
                port,
                source_port: Some(source_port),
            },
        },
    );
    Ok(Step::Done)
}

fn connect_unix(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let path = PathBuf::from(args.string(1)?);
    state.open(
        name,
        LinkSpec {
            role: Role::Connect,
            endpoint: Endpoint::Unix(path),
        },
    );
    Ok(Step::Done)
}

fn listen_tcp(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let port = args.port(1)?;
    state.open(
        name,
        LinkSpec {
            role: Role::Listen,
            endpoint: Endpoint::Tcp {
                port,
                source_port: None,
            },
        },
    );
    Ok(Step::Done)
}

fn listen_unix(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let path = PathBuf::from(args.string(1)?);
    state.open(
        name,
        LinkSpec {
            role: Role::Listen,
            endpoint: Endpoint::Unix(path),
        },
    );
    Ok(Step::Done)
}

fn disconnect(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let connection = state.connection_mut(name)?;
    if connection.disconnected {
        return Err(Error::UnknownLink(name.to_string()));
    }
    connection.disconnected = true;
    connection.link = None;
    connection.state = LinkState::Closed;
    tracing::info!(link = name, "Disconnected from merlin");
    Ok(Step::Done)
}

fn is_connected(state: &mut MerlinState, corr: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    if state.connection(name)?.state == LinkState::Connected {
        return Ok(Step::Done);
    }

    let timeout = state.context.timeouts().connect();
    corr.arm(
        Watch::Connected {
            link: name.to_string(),
        },
        timeout,
        Verdict::fail(Error::NotConnected.to_string()),
    )?;
    Ok(Step::Deferred)
}

fn is_disconnected(state: &mut MerlinState, corr: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    if state.connection(name)?.state == LinkState::Closed {
        return Ok(Step::Done);
    }

    let timeout = state.context.timeouts().connect();
    corr.arm(
        Watch::Disconnected {
            link: name.to_string(),
        },
        timeout,
        Verdict::fail("Still connected"),
    )?;
    Ok(Step::Deferred)
}

fn send_event(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let event_type = event_type(args, 1)?;
    let fields = args.table(2)?;

    let record = EventRecord {
        event_type: event_type.to_string(),
        fields,
    };
    let bytes = state.context.codec().encode(&record)?;

    let connection = state.connection(name)?;
    match (&connection.link, connection.state) {
        (Some(link), LinkState::Connected) => link.send(bytes)?,
        _ => return Err(Error::NotConnected),
    }

    tracing::debug!(link = name, event = %record, "Sent raw event");
    Ok(Step::Done)
}

fn clear_buffer(state: &mut MerlinState, _: &mut Corr, args: &StepArgs) -> Result<Step> {
    let name = args.string(0)?;
    let connection = state.connection_mut(name)?;
    tracing::debug!(link = name, dropped = connection.buffer.len(), "Clearing buffer");
    connection.buffer.clear();
    Ok(Step::Done)
}

fn received_event(state: &mut MerlinState, corr: &mut Corr, args: &StepArgs) -> Result<Step> {
    let (name, criteria) = criteria(args)?;
    let connection = state.connection(&name)?;
    if connection.buffer.iter().any(|e| criteria.matches(e)) {
        return Ok(Step::Done);
    }
    if connection.state == LinkState::Closed {
        return Err(Error::NotConnected);
    }

    let timeout = state.context.timeouts().event();
    let message = format!("No matching {} event received", criteria.event_type);
    corr.arm(
        Watch::Event {
            link: name,
            criteria,
            expect: Expectation::Eventually,
        },
        timeout,
        Verdict::Fail(message),
    )?;
    Ok(Step::Deferred)
}

fn not_received_event(state: &mut MerlinState, corr: &mut Corr, args: &StepArgs) -> Result<Step> {
    let (name, criteria) = criteria(args)?;
    let connection = state.connection(&name)?;
    if connection.buffer.iter().any(|e| criteria.matches(e)) {
        return Err(Error::step_failed(unexpected(&criteria.event_type)));
    }
    if connection.state == LinkState::Closed {
        return Err(Error::NotConnected);
    }

    let timeout = state.context.timeouts().absence();
    corr.arm(
        Watch::Event {
            link: name,
            criteria,
            expect: Expectation::Never,
        },
        timeout,
        Verdict::Pass,
    )?;
    Ok(Step::Deferred)
}

fn event_type(args: &StepArgs, index: usize) -> Result<&str> {
    let name = args.string(index)?;
    if !is_event_type(name) {
        return Err(Error::argument(
            index,
            format!("unknown event type {}", name),
        ));
    }
    Ok(name)
}

fn criteria(args: &StepArgs) -> Result<(String, MatchCriteria)> {
    let name = args.string(0)?.to_string();
    let event_type = event_type(args, 1)?;
    Ok((name, MatchCriteria::new(event_type, args.table(2)?)))
}

fn unexpected(event_type: &str) -> String {
    format!("Unexpected {} event received", event_type)
}
