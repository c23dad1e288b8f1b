//! Byte-stream links to the event broker under test
//!
//! A link is a TCP or unix-socket connection owned by one step handler. The
//! socket is driven by its own task; everything the task observes is
//! reported back as a [`PeerMessage`] on the owning connection's channel, so
//! handler state is only ever touched by the connection task itself.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

use super::codec::EventDecoder;
use super::types::EventRecord;

#[cfg(unix)]
mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Stream};
    pub use interprocess::local_socket::traits::tokio::{
        Listener as ListenerTrait, Stream as StreamTrait,
    };
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

/// Which side of the connection the link plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connect to a listening broker
    Connect,
    /// Listen and accept exactly one broker connection
    Listen,
}

/// Where the link connects to or listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Local TCP port, optionally bound to a fixed source port when connecting
    Tcp { port: u16, source_port: Option<u16> },
    /// Unix domain socket path
    Unix(PathBuf),
}

/// Full description of a link to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub role: Role,
    pub endpoint: Endpoint,
}

impl std::fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self.role {
            Role::Connect => "connect",
            Role::Listen => "listen",
        };
        match &self.endpoint {
            Endpoint::Tcp {
                port,
                source_port: Some(source),
            } => write!(f, "{} tcp:{} from port {}", verb, port, source),
            Endpoint::Tcp { port, .. } => write!(f, "{} tcp:{}", verb, port),
            Endpoint::Unix(path) => write!(f, "{} unix:{}", verb, path.display()),
        }
    }
}

/// Something that happened on a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Event(EventRecord),
    Failed(String),
    Closed,
}

/// Identifies the scenario handler instance that owns a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Step module tag
    pub tag: String,
    /// Scenario generation on the owning connection
    pub generation: u64,
}

/// A link notification on its way to the owning connection task
#[derive(Debug, Clone)]
pub struct PeerMessage {
    pub route: Route,
    pub link: String,
    pub link_id: u64,
    pub event: LinkEvent,
}

/// Sender half used by link tasks to report back
#[derive(Debug, Clone)]
pub struct LinkNotifier {
    tx: mpsc::UnboundedSender<PeerMessage>,
    route: Route,
    link: String,
    link_id: u64,
}

impl LinkNotifier {
    pub fn new(
        tx: mpsc::UnboundedSender<PeerMessage>,
        route: Route,
        link: impl Into<String>,
        link_id: u64,
    ) -> Self {
        Self {
            tx,
            route,
            link: link.into(),
            link_id,
        }
    }

    fn notify(&self, event: LinkEvent) {
        // The owning connection may already be gone
        let _ = self.tx.send(PeerMessage {
            route: self.route.clone(),
            link: self.link.clone(),
            link_id: self.link_id,
            event,
        });
    }
}

/// Handle to a running link; dropping it closes the socket
#[derive(Debug)]
pub struct Link {
    id: u64,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl Link {
    /// Spawn the link task. Must be called from within the tokio runtime.
    pub fn open(spec: LinkSpec, decoder: Box<dyn EventDecoder>, notifier: LinkNotifier) -> Self {
        let id = notifier.link_id;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        tracing::debug!(link = %notifier.link, id, %spec, "Opening link");
        let task = tokio::spawn(run_link(spec, decoder, outgoing_rx, notifier));

        Self { id, outgoing, task }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue bytes for sending
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        self.outgoing.send(data).map_err(|_| Error::NotConnected)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_link(
    spec: LinkSpec,
    decoder: Box<dyn EventDecoder>,
    outgoing_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    notifier: LinkNotifier,
) {
    let result = match (&spec.role, &spec.endpoint) {
        (Role::Connect, Endpoint::Tcp { port, source_port }) => {
            match connect_tcp(*port, *source_port).await {
                Ok(stream) => pump(stream, decoder, outgoing_rx, &notifier).await,
                Err(e) => Err(e),
            }
        }
        (Role::Listen, Endpoint::Tcp { port, .. }) => match accept_tcp(*port).await {
            Ok(stream) => pump(stream, decoder, outgoing_rx, &notifier).await,
            Err(e) => Err(e),
        },
        #[cfg(unix)]
        (Role::Connect, Endpoint::Unix(path)) => match connect_unix(path).await {
            Ok(stream) => pump(stream, decoder, outgoing_rx, &notifier).await,
            Err(e) => Err(e),
        },
        #[cfg(unix)]
        (Role::Listen, Endpoint::Unix(path)) => match accept_unix(path).await {
            Ok(stream) => pump(stream, decoder, outgoing_rx, &notifier).await,
            Err(e) => Err(e),
        },
        #[cfg(not(unix))]
        (_, Endpoint::Unix(_)) => Err(Error::Internal(
            "unix socket links are not supported on this platform".to_string(),
        )),
    };

    if let Err(e) = result {
        tracing::warn!(link = %notifier.link, %spec, "Link failed: {}", e);
        notifier.notify(LinkEvent::Failed(e.to_string()));
    }
    tracing::debug!(link = %notifier.link, "Link closed");
    notifier.notify(LinkEvent::Closed);
}

async fn connect_tcp(port: u16, source_port: Option<u16>) -> Result<tokio::net::TcpStream> {
    let dest = SocketAddr::from(([127, 0, 0, 1], port));
    let socket = TcpSocket::new_v4()?;
    if let Some(source_port) = source_port {
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], source_port)))?;
    }
    let stream = socket.connect(dest).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn accept_tcp(port: u16) -> Result<tokio::net::TcpStream> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let (stream, peer) = listener.accept().await?;
    tracing::debug!(%peer, port, "Accepted broker connection");
    Ok(stream)
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> Result<platform::Stream> {
    use platform::*;

    let name = path
        .to_string_lossy()
        .into_owned()
        .to_fs_name::<GenericFilePath>()?;
    Ok(Stream::connect(name).await?)
}

#[cfg(unix)]
async fn accept_unix(path: &std::path::Path) -> Result<platform::Stream> {
    use platform::*;

    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let name = path
        .to_string_lossy()
        .into_owned()
        .to_fs_name::<GenericFilePath>()?;
    let listener = ListenerOptions::new().name(name).create_tokio()?;
    let stream = listener.accept().await?;
    tracing::debug!(path = %path.display(), "Accepted broker connection");
    Ok(stream)
}

/// Shuttle bytes between the socket and the owning connection
async fn pump<S>(
    stream: S,
    mut decoder: Box<dyn EventDecoder>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    notifier: &LinkNotifier,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    notifier.notify(LinkEvent::Connected);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                decoder.push(&buf[..n]);
                while let Some(event) = decoder.next_event()? {
                    tracing::trace!(link = %notifier.link, %event, "Received event");
                    notifier.notify(LinkEvent::Event(event));
                }
            }
            outgoing = outgoing_rx.recv() => match outgoing {
                Some(data) => {
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                }
                None => return Ok(()),
            }
        }
    }
}
