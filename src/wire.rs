use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Local identifier of an established connection, in creation order.
pub type ConnId = u64;

/// What a connection worker reports to the owning event loop.
#[derive(Debug)]
pub enum NetEvent {
    Message(ConnId, Envelope),
    Closed(ConnId),
}

/// Sending half of a full-duplex connection worker. Sends never block: they
/// enqueue the envelope for the writer task.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    out: mpsc::UnboundedSender<Envelope>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, out: mpsc::UnboundedSender<Envelope>) -> Connection {
        Connection { id, out }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.out
            .send(envelope)
            .map_err(|_| Error::Channel(format!("connection {} is closed", self.id)))
    }
}

/// Spawns the reader and writer tasks of a connection and returns its sending
/// half. The reader decodes one framed message at a time and pushes it on the
/// event channel; end of stream and read failures both surface as a single
/// `Closed` event so the owner can tear the connection down.
pub fn spawn_worker(
    stream: TcpStream,
    id: ConnId,
    events: mpsc::UnboundedSender<NetEvent>,
) -> Connection {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut source) = framed.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        trace!("connection {}: starting sender task", id);
        while let Some(envelope) = out_rx.recv().await {
            let bytes = match envelope.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("connection {}: cannot encode outgoing message: {}", id, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Bytes::from(bytes)).await {
                debug!("connection {}: send failed: {}", id, e);
                break;
            }
        }
        trace!("connection {}: sender task stopped", id);
    });

    tokio::spawn(async move {
        trace!("connection {}: starting receiver task", id);
        loop {
            match source.next().await {
                Some(Ok(frame)) => match Envelope::decode(&frame) {
                    Ok(envelope) => {
                        if events.send(NetEvent::Message(id, envelope)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("connection {}: dropping undecodable frame: {}", id, e);
                    }
                },
                Some(Err(e)) => {
                    warn!("connection {}: read failed: {}", id, e);
                    let _ = events.send(NetEvent::Closed(id));
                    return;
                }
                None => {
                    debug!("connection {}: remote end point closed", id);
                    let _ = events.send(NetEvent::Closed(id));
                    return;
                }
            }
        }
    });

    Connection::new(id, out_tx)
}
