//! What a step module instance receives when a scenario begins

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::{EventCodec, Link, LinkNotifier, LinkSpec, PeerMessage, Route};
use crate::common::config::Timeouts;

/// Per-instance handle onto the owning connection
///
/// Links opened through the context report back to the connection task that
/// owns the instance, tagged with its route so stale traffic can be dropped.
#[derive(Clone)]
pub struct ScenarioContext {
    route: Route,
    peers: mpsc::UnboundedSender<PeerMessage>,
    timeouts: Timeouts,
    codec: Arc<dyn EventCodec>,
    next_link_id: u64,
}

impl ScenarioContext {
    pub fn new(
        route: Route,
        peers: mpsc::UnboundedSender<PeerMessage>,
        timeouts: Timeouts,
        codec: Arc<dyn EventCodec>,
    ) -> Self {
        Self {
            route,
            peers,
            timeouts,
            codec,
            next_link_id: 0,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn codec(&self) -> &dyn EventCodec {
        self.codec.as_ref()
    }

    /// Open a link named `name`; each call gets a fresh link id
    pub fn open_link(&mut self, name: &str, spec: LinkSpec) -> Link {
        self.next_link_id += 1;
        let notifier = LinkNotifier::new(
            self.peers.clone(),
            self.route.clone(),
            name,
            self.next_link_id,
        );
        Link::open(spec, self.codec.decoder(), notifier)
    }
}

impl std::fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("route", &self.route)
            .field("timeouts", &self.timeouts)
            .field("next_link_id", &self.next_link_id)
            .finish_non_exhaustive()
    }
}
