//! Step server - TCP listener and per-connection event loop

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::common::config::Config;
use crate::common::Result;
use crate::wire::transport::{self, LineFramer};
use crate::wire::Reply;

use super::handler::{self, Dispatch};
use super::session::{ScenarioSession, SessionFactory};
use super::ServerContext;

/// Listening step server
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    max_frame: usize,
}

impl Server {
    /// Bind the listening socket
    pub async fn bind(config: &Config, context: ServerContext) -> Result<Self> {
        let listener = transport::create_listener(&config.server.listen_address()).await?;

        Ok(Self {
            listener,
            context: Arc::new(context),
            max_frame: config.server.max_frame_bytes,
        })
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Connections still open at shutdown are aborted, which tears down
    /// their scenarios.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Step server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, closing connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "Runner connected");
                        let context = self.context.clone();
                        let max_frame = self.max_frame;
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, context, max_frame).await {
                                tracing::warn!(%peer, "Connection closed with error: {}", e);
                            }
                            tracing::info!(%peer, "Runner disconnected");
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        tracing::info!("Step server stopped");
        Ok(())
    }
}

/// Serve one runner connection
///
/// Frames are handled strictly in order. While a deferred step owes its
/// reply, no further frame is handled, but the socket is still read so a
/// closed connection is noticed at once.
async fn handle_connection(
    stream: TcpStream,
    context: Arc<ServerContext>,
    max_frame: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (peers, mut peer_rx) = mpsc::unbounded_channel();

    let mut factory = SessionFactory::new(context, peers);
    let mut session: Option<ScenarioSession> = None;
    let mut framer = LineFramer::new(max_frame);
    let mut owed: Option<String> = None;
    let mut buf = vec![0u8; 8192];

    loop {
        while owed.is_none() {
            let Some(frame) = framer.next_frame()? else {
                break;
            };

            tracing::debug!(frame = %String::from_utf8_lossy(&frame), "Received command");
            match handler::handle_frame(&mut session, &mut factory, &frame) {
                Dispatch::Reply(reply) => send_reply(&mut writer, &reply).await?,
                Dispatch::Deferred { tag } => owed = Some(tag),
            }
        }

        let deadline = session.as_ref().and_then(ScenarioSession::next_deadline);

        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    tracing::debug!("Runner closed the connection");
                    break;
                }
                framer.push(&buf[..n])?;
            }
            Some(message) = peer_rx.recv() => {
                if let Some(sess) = session.as_mut() {
                    sess.deliver(message);
                }
            }
            _ = sleep_until(deadline) => {
                if let Some(sess) = session.as_mut() {
                    sess.expire(Instant::now());
                }
            }
        }

        let resolved = match (&owed, session.as_mut()) {
            (Some(tag), Some(sess)) => sess.take_verdict(tag),
            _ => None,
        };
        if let Some(verdict) = resolved {
            owed = None;
            send_reply(&mut writer, &handler::verdict_reply(verdict)).await?;
        }
    }

    // Dropping the session stops any pending step and closes its links
    drop(session);
    Ok(())
}

async fn send_reply<W>(writer: &mut W, reply: &Reply) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    tracing::debug!(reply = %reply.to_value(), "Sending reply");
    transport::send_message(writer, reply).await
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
