//! Connection plumbing beneath the proxy.
//!
//! The proxy never touches a TCP stream directly: every connection is split
//! into a reader task that forwards decoded multipart messages over a
//! channel and a writer task that drains an unbounded send queue. The
//! channel senders and receivers are what the proxy owns and polls, which
//! is what lets one thread multiplex every connection without blocking.
//!
//! Incoming connections all feed one shared event channel tagged with a
//! route id (the listener behaves like a single router endpoint); each
//! outgoing connection gets its own event channel so the proxy can poll the
//! remotes vector positionally.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::{Bytes, BytesMut};
use peerbus_wire::{encode_message, MessageDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::{Allow, AuthRequest};
use crate::keys::PubKey;

/// One logical message: a sequence of frames.
pub(crate) type Multipart = Vec<Bytes>;

/// Identity of an incoming connection on the listener side.
pub(crate) type RouteId = u64;

/// Greeting token opening a handshake.
const HELLO: &[u8] = b"HELLO";
/// Greeting reply admitting a connection.
const WELCOME: &[u8] = b"WELCOME";
/// Greeting reply refusing a connection.
const DENIED: &[u8] = b"DENIED";

/// Transport tunables.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// How long a handshake may take before the connection is abandoned.
    pub handshake_timeout: Duration,
    /// Cap on a single incoming message; `None` disables the cap.
    pub max_message_size: Option<usize>,
    /// How long a closing connection may spend flushing queued writes.
    pub close_linger: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_message_size: Some(peerbus_wire::DEFAULT_MAX_MESSAGE_SIZE),
            close_linger: Duration::from_secs(5),
        }
    }
}

/// Events from incoming connections, shared across all listeners.
pub(crate) enum IncomingEvent {
    /// A connection finished its handshake and was admitted.
    Opened {
        route: RouteId,
        pubkey: PubKey,
        allow: Allow,
        writer: mpsc::UnboundedSender<Multipart>,
    },
    /// A message arrived over an admitted connection.
    Message { route: RouteId, parts: Multipart },
    /// An admitted connection went away.
    Closed { route: RouteId },
}

/// Events from one outgoing connection.
#[derive(Debug)]
pub(crate) enum RemoteEvent {
    /// The handshake completed and queued sends are flowing.
    Connected,
    /// A message arrived from the remote.
    Message { parts: Multipart },
    /// The connection failed or closed; the slot should be retired.
    Closed,
}

/// Shared context handed to listener and incoming-connection tasks.
#[derive(Clone)]
pub(crate) struct ListenerCtx {
    pub local_pubkey: PubKey,
    pub auth_tx: mpsc::UnboundedSender<AuthRequest>,
    pub events_tx: mpsc::UnboundedSender<IncomingEvent>,
    pub routes: Arc<AtomicU64>,
    pub tunables: Tunables,
}

/// Read one multipart message, pulling more bytes as needed.
pub(crate) async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut MessageDecoder,
    buf: &mut BytesMut,
) -> anyhow::Result<Multipart> {
    loop {
        if let Some(parts) = decoder.decode(buf)? {
            return Ok(parts);
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            bail!("connection closed");
        }
    }
}

/// Write one multipart message.
pub(crate) async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    parts: &[Bytes],
) -> std::io::Result<()> {
    writer.write_all(&encode_message(parts)).await
}

/// Drain a send queue onto a socket until the queue closes or a write
/// stalls past the linger budget.
async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Multipart>,
    linger: Duration,
) {
    while let Some(parts) = queue.recv().await {
        let data = encode_message(&parts);
        match timeout(linger, writer.write_all(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("write stalled past linger budget; dropping connection");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Accept connections on one listener, spawning a handshake task per
/// connection.
pub(crate) fn spawn_listener(listener: TcpListener, ctx: ListenerCtx) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let route = ctx.routes.fetch_add(1, Ordering::Relaxed);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_incoming(stream, addr, route, ctx).await {
                            debug!("incoming connection from {} ended: {:#}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

/// Handshake and serve one incoming connection.
async fn run_incoming(
    stream: TcpStream,
    addr: SocketAddr,
    route: RouteId,
    ctx: ListenerCtx,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = MessageDecoder::new(ctx.tunables.max_message_size);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let hs = ctx.tunables.handshake_timeout;

    let hello = timeout(hs, read_message(&mut reader, &mut decoder, &mut buf))
        .await
        .context("handshake timed out")??;
    if hello.len() != 2 || hello[0] != HELLO {
        bail!("bad greeting");
    }
    let pubkey = PubKey::from_slice(&hello[1]).ok_or_else(|| anyhow!("bad pubkey length"))?;

    // The admission dialog: ask the proxy whether this peer may connect.
    let (reply_tx, reply_rx) = oneshot::channel();
    ctx.auth_tx
        .send(AuthRequest {
            ip: addr.ip(),
            pubkey,
            reply: reply_tx,
        })
        .map_err(|_| anyhow!("proxy is gone"))?;
    let decision = timeout(hs, reply_rx)
        .await
        .context("admission timed out")?
        .context("admission request dropped")?;

    let Some(allow) = decision else {
        let _ = write_message(&mut writer, &[Bytes::from_static(DENIED)]).await;
        return Ok(());
    };
    write_message(
        &mut writer,
        &[
            Bytes::from_static(WELCOME),
            Bytes::copy_from_slice(ctx.local_pubkey.as_bytes()),
        ],
    )
    .await?;

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(writer, writer_rx, ctx.tunables.close_linger));

    if ctx
        .events_tx
        .send(IncomingEvent::Opened {
            route,
            pubkey,
            allow,
            writer: writer_tx,
        })
        .is_err()
    {
        return Ok(());
    }
    info!("peer {} connected from {}", pubkey, addr);

    loop {
        match read_message(&mut reader, &mut decoder, &mut buf).await {
            Ok(parts) => {
                if ctx
                    .events_tx
                    .send(IncomingEvent::Message { route, parts })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!("connection from {} closed: {:#}", addr, e);
                break;
            }
        }
    }

    let _ = ctx.events_tx.send(IncomingEvent::Closed { route });
    Ok(())
}

/// Open an outgoing connection.
///
/// Returns immediately with the send queue and the event stream for the
/// new remote slot; the connect and handshake happen in the background, and
/// messages queued meanwhile are flushed once the handshake completes. A
/// failed handshake surfaces as `RemoteEvent::Closed`, dropping whatever
/// was queued.
pub(crate) fn spawn_remote(
    addr: String,
    expected: PubKey,
    local_pubkey: PubKey,
    tunables: Tunables,
) -> (
    mpsc::UnboundedSender<Multipart>,
    mpsc::UnboundedReceiver<RemoteEvent>,
) {
    let (send_tx, send_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = run_remote(&addr, expected, local_pubkey, tunables, send_rx, &event_tx).await
        {
            warn!("outgoing connection to {} ({}) ended: {:#}", expected, addr, e);
        }
        let _ = event_tx.send(RemoteEvent::Closed);
    });

    (send_tx, event_rx)
}

async fn run_remote(
    addr: &str,
    expected: PubKey,
    local_pubkey: PubKey,
    tunables: Tunables,
    send_rx: mpsc::UnboundedReceiver<Multipart>,
    events: &mpsc::UnboundedSender<RemoteEvent>,
) -> anyhow::Result<()> {
    let hs = tunables.handshake_timeout;
    let mut decoder = MessageDecoder::new(tunables.max_message_size);
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let stream = timeout(hs, TcpStream::connect(addr))
        .await
        .context("connect timed out")??;
    let (mut reader, mut writer) = stream.into_split();

    write_message(
        &mut writer,
        &[
            Bytes::from_static(HELLO),
            Bytes::copy_from_slice(local_pubkey.as_bytes()),
        ],
    )
    .await?;

    let greeting = timeout(hs, read_message(&mut reader, &mut decoder, &mut buf))
        .await
        .context("handshake timed out")??;
    if greeting.len() == 2 && greeting[0] == WELCOME {
        let remote = PubKey::from_slice(&greeting[1])
            .ok_or_else(|| anyhow!("bad pubkey length in greeting"))?;
        if remote != expected {
            bail!("remote identified as {}, expected {}", remote, expected);
        }
    } else if greeting.first().map(|f| f == DENIED).unwrap_or(false) {
        bail!("connection refused by remote");
    } else {
        bail!("unexpected greeting");
    }

    let _ = events.send(RemoteEvent::Connected);
    tokio::spawn(run_writer(writer, send_rx, tunables.close_linger));
    debug!("outgoing connection to {} established", expected);

    loop {
        let parts = read_message(&mut reader, &mut decoder, &mut buf).await?;
        if events.send(RemoteEvent::Message { parts }).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_io_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let msg = vec![Bytes::from_static(b"x.echo"), Bytes::from_static(b"hi")];
        write_message(&mut a, &msg).await.unwrap();

        let mut decoder = MessageDecoder::default();
        let mut buf = BytesMut::new();
        let read = read_message(&mut b, &mut decoder, &mut buf).await.unwrap();
        assert_eq!(read, msg);
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let mut decoder = MessageDecoder::default();
        let mut buf = BytesMut::new();
        assert!(read_message(&mut b, &mut decoder, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_drains_queue_then_closes() {
        let (a, mut b) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(vec![Bytes::from_static(b"one")]).unwrap();
        tx.send(vec![Bytes::from_static(b"two")]).unwrap();
        drop(tx);

        let writer = tokio::spawn(run_writer(a, rx, Duration::from_secs(1)));

        let mut decoder = MessageDecoder::default();
        let mut buf = BytesMut::new();
        let first = read_message(&mut b, &mut decoder, &mut buf).await.unwrap();
        let second = read_message(&mut b, &mut decoder, &mut buf).await.unwrap();
        assert_eq!(first[0], Bytes::from_static(b"one"));
        assert_eq!(second[0], Bytes::from_static(b"two"));

        // Queue closed after draining, so the socket shuts down.
        assert!(read_message(&mut b, &mut decoder, &mut buf).await.is_err());
        writer.await.unwrap();
    }
}
