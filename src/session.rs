use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::constants::CommandCode;
use crate::error::Error;
use crate::frame::{Decode, Packet, PacketCodec};

/// How long a NAK'd command waits before it is retried.
const NAK_RETRY_DELAY: Duration = Duration::from_millis(150);

type PacketSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, PacketCodec>;

/// A session owns the duplex byte stream connected to a PLM.
///
/// A background task reads frames off the stream and fans the decoded
/// packets out to every open [Inbox]. Writes go through a single-writer
/// slot: one operation at a time owns the write half, and a shared pacing
/// deadline spaces consecutive writes out so the PLM is never fed faster
/// than it can forward to the powerline.
pub(crate) struct Session {
    writer: tokio::sync::Mutex<WriteState>,
    inboxes: Arc<Mutex<InboxRegistry>>,
    cancel: CancellationToken,
}

struct WriteState {
    sink: PacketSink,
    /// Writes must not happen before this deadline. Shared across
    /// operations: a new operation's first write respects the trailing
    /// delay of the previous one.
    no_writes_before: Instant,
}

#[derive(Default)]
struct InboxRegistry {
    senders: Vec<(u64, mpsc::UnboundedSender<Packet>)>,
    next_id: u64,
}

impl Session {
    /// Creates a session over a duplex stream and spawns its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(stream: impl AsyncRead + AsyncWrite + Send + 'static) -> Session {
        let (reader, writer) = tokio::io::split(stream);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        let inboxes = Arc::new(Mutex::new(InboxRegistry::default()));
        let cancel = CancellationToken::new();

        tokio::spawn(read_loop(
            FramedRead::new(reader, PacketCodec),
            inboxes.clone(),
            cancel.clone(),
        ));

        Session {
            writer: tokio::sync::Mutex::new(WriteState {
                sink: FramedWrite::new(writer, PacketCodec),
                no_writes_before: Instant::now(),
            }),
            inboxes,
            cancel,
        }
    }

    /// Terminates the reader task. Pending and future operations fail.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    /// Registers a new inbox. Every packet framed off the wire from this
    /// point on is delivered to it, in wire order, until it is dropped.
    pub(crate) fn open_inbox(&self) -> Inbox {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut registry = self.inboxes.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.push((id, sender));

        Inbox {
            receiver,
            id,
            registry: self.inboxes.clone(),
        }
    }

    /// Starts an operation: waits for the single-writer slot (FIFO) and
    /// opens a fresh inbox for the operation's replies. Both are released
    /// when the returned [Operation] is dropped, on every exit path.
    pub(crate) async fn operation(&self, write_delay: Duration) -> Result<Operation<'_>, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Disconnected);
        }

        let writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = self.cancel.cancelled() => return Err(Error::Disconnected),
        };

        Ok(Operation {
            writer,
            inbox: self.open_inbox(),
            cancel: &self.cancel,
            write_delay,
        })
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut framed: FramedRead<Box<dyn AsyncRead + Send + Unpin>, PacketCodec>,
    inboxes: Arc<Mutex<InboxRegistry>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => break,
        };

        match frame {
            Some(Ok(packet)) => {
                debug!("received packet: {:02x?}", packet);

                let mut registry = inboxes.lock().unwrap();
                registry
                    .senders
                    .retain(|(_, sender)| sender.send(packet.clone()).is_ok());
            }
            Some(Err(e)) => {
                error!("failed to read from modem: {}", e);
                break;
            }
            None => {
                debug!("modem stream ended");
                break;
            }
        }
    }

    // Fail pending reads immediately rather than leaving them waiting on
    // replies that can no longer arrive.
    cancel.cancel();
    inboxes.lock().unwrap().senders.clear();
}

/// A registered consumer of incoming packets. Unregisters itself when
/// dropped; a delivery in flight at that point is simply abandoned.
pub(crate) struct Inbox {
    receiver: mpsc::UnboundedReceiver<Packet>,
    id: u64,
    registry: Arc<Mutex<InboxRegistry>>,
}

impl Inbox {
    pub(crate) async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap()
            .senders
            .retain(|(id, _)| *id != self.id);
    }
}

/// An in-flight operation: the exclusive holder of the write slot, plus
/// the inbox its replies arrive on.
///
/// The primitives here are the steps operation recipes are built from.
pub(crate) struct Operation<'a> {
    writer: tokio::sync::MutexGuard<'a, WriteState>,
    inbox: Inbox,
    cancel: &'a CancellationToken,
    write_delay: Duration,
}

impl Operation<'_> {
    /// Replaces the pacing delay applied after each write, returning the
    /// previous one.
    pub(crate) fn set_write_delay(&mut self, write_delay: Duration) -> Duration {
        std::mem::replace(&mut self.write_delay, write_delay)
    }

    /// Writes a packet, honoring the session pacing deadline, then pushes
    /// the deadline out by the operation's write delay.
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        if self.writer.no_writes_before > Instant::now() {
            tokio::select! {
                _ = tokio::time::sleep_until(self.writer.no_writes_before) => {}
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        debug!("sending packet: {:02x?}", packet);
        self.writer.sink.send(packet.clone()).await?;
        self.writer.no_writes_before = Instant::now() + self.write_delay;

        Ok(())
    }

    /// Waits for the next packet bearing the expected command code.
    ///
    /// Packets with a different code are skipped: they are either
    /// unsolicited traffic or late replies to a cancelled operation, and
    /// other interested parties have their own inboxes.
    pub(crate) async fn read_packet(&mut self, command_code: CommandCode) -> Result<Packet, Error> {
        loop {
            let packet = tokio::select! {
                packet = self.inbox.recv() => packet.ok_or(Error::Disconnected)?,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };

            if packet.command_code == command_code {
                return Ok(packet);
            }
        }
    }

    /// Writes a packet and returns the matching echo, whatever its ACK
    /// byte says.
    pub(crate) async fn raw_roundtrip(&mut self, packet: &Packet) -> Result<Packet, Error> {
        self.write_packet(packet).await?;
        self.read_packet(packet.command_code).await
    }

    /// Writes a packet until the PLM acknowledges it, backing off between
    /// attempts, then decodes the echoed payload.
    ///
    /// A NAK means the PLM is busy; commands for which a NAK carries
    /// meaning use [Operation::raw_roundtrip] instead.
    pub(crate) async fn roundtrip<T: Decode>(&mut self, packet: &Packet) -> Result<T, Error> {
        loop {
            let reply = self.raw_roundtrip(packet).await?;

            if reply.is_ack() {
                return T::decode(&reply.payload);
            }

            warn!(
                "command {:02x?} not acknowledged, retrying in {:?}",
                packet.command_code, NAK_RETRY_DELAY
            );

            tokio::select! {
                _ = tokio::time::sleep(NAK_RETRY_DELAY) => {}
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn fanout_preserves_order_across_inboxes() {
        let (stream, mut plm) = tokio::io::duplex(256);
        let session = Session::new(stream);

        let mut first = session.open_inbox();
        let mut second = session.open_inbox();

        plm.write_all(&[0x02, 0x69, 0x06, 0x02, 0x6a, 0x15])
            .await
            .unwrap();

        for inbox in [&mut first, &mut second] {
            let packet = inbox.recv().await.unwrap();
            assert_eq!(CommandCode::GetFirstAllLinkRecord, packet.command_code);
            let packet = inbox.recv().await.unwrap();
            assert_eq!(CommandCode::GetNextAllLinkRecord, packet.command_code);
        }
    }

    #[tokio::test]
    async fn dropped_inbox_is_pruned() {
        let (stream, mut plm) = tokio::io::duplex(256);
        let session = Session::new(stream);

        let first = session.open_inbox();
        let mut second = session.open_inbox();

        drop(first);

        plm.write_all(&[0x02, 0x55]).await.unwrap();

        let packet = second.recv().await.unwrap();
        assert_eq!(CommandCode::UserResetDetected, packet.command_code);
        assert_eq!(1, session.inboxes.lock().unwrap().senders.len());
    }

    #[tokio::test]
    async fn transport_eof_closes_inboxes() {
        let (stream, plm) = tokio::io::duplex(256);
        let session = Session::new(stream);

        let mut inbox = session.open_inbox();
        drop(plm);

        assert!(inbox.recv().await.is_none());
        assert!(session.close_token().is_cancelled());
    }
}
