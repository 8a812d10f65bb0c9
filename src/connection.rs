//! Per-connection session state machine.
//!
//! A connection runs two loops over the split transport:
//!
//! - the read loop walks `ReadingHeader -> ReadingBody -> ReadingHeader`,
//!   dispatching each complete frame by message type
//! - the write loop drains the connection's outbound queue in order,
//!   cycling `Idle -> Writing -> Idle`
//!
//! Whichever loop finishes first (EOF, framing error, transport error) ends
//! the connection: the other loop is dropped, the connection leaves the
//! room, and the outbound queue is released.
//!
//! The outbound queue is an unbounded mpsc channel. Its only strong sender
//! ([`Outbox`]) lives in the connection task; the room keeps a weak
//! [`Peer`] so a closed connection simply stops accepting frames.

use crate::codec::{Codec, CodecError, Payload};
use crate::frame::{self, FrameError, MessageFrame, MessageType, HEADER_LENGTH};
use crate::room::Room;
use bytes::BytesMut;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Identifier of a live connection, unique among live connections.
pub type ConnectionId = usize;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Read side of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Transport accepted, nothing read yet.
    Connecting,
    /// Waiting for the 8-byte header.
    ReadingHeader,
    /// Header decoded, waiting for the body.
    ReadingBody { body_size: usize, msg_type: u32 },
    /// Transport closed or failed.
    Closed,
}

/// Write side of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Writing,
    Closed,
}

/// Reads whole frames from a transport.
pub struct FrameReader<R> {
    reader: R,
    state: ReadState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: ReadState::Connecting,
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF inside a
    /// frame is a transport error.
    pub async fn next_frame(&mut self) -> Result<Option<MessageFrame>, ConnectionError> {
        let result = self.read_frame().await;
        if !matches!(result, Ok(Some(_))) {
            self.state = ReadState::Closed;
        }
        result
    }

    async fn read_frame(&mut self) -> Result<Option<MessageFrame>, ConnectionError> {
        self.state = ReadState::ReadingHeader;

        let mut header = [0u8; HEADER_LENGTH];
        let mut filled = 0;
        while filled < HEADER_LENGTH {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            filled += n;
        }

        let header = frame::decode_header(&header)?;
        self.state = ReadState::ReadingBody {
            body_size: header.body_size,
            msg_type: header.msg_type,
        };

        let mut body = BytesMut::zeroed(header.body_size);
        self.reader.read_exact(&mut body).await?;

        let frame = MessageFrame::new(header.msg_type, body.freeze())?;
        self.state = ReadState::ReadingHeader;
        Ok(Some(frame))
    }
}

/// Writes whole frames to a transport.
pub struct FrameWriter<W> {
    writer: W,
    state: WriteState,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: WriteState::Idle,
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub async fn write_frame(&mut self, frame: &MessageFrame) -> io::Result<()> {
        self.state = WriteState::Writing;
        match self.writer.write_all(&frame.to_bytes()).await {
            Ok(()) => {
                self.state = WriteState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = WriteState::Closed;
                Err(e)
            }
        }
    }
}

/// Owning end of a connection's outbound queue.
pub struct Outbox {
    tx: mpsc::UnboundedSender<MessageFrame>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MessageFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Non-owning handle for the room.
    pub fn peer(&self) -> Peer {
        Peer {
            tx: self.tx.downgrade(),
        }
    }
}

/// Non-owning handle to a connection's outbound queue.
#[derive(Clone)]
pub struct Peer {
    tx: mpsc::WeakUnboundedSender<MessageFrame>,
}

impl Peer {
    /// Queue a frame if the connection is still alive.
    pub fn deliver(&self, frame: MessageFrame) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").finish_non_exhaustive()
    }
}

/// Per-connection behaviour shared by every connection on a server.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub codec: Codec,
    /// Rebroadcast frames of unknown type verbatim instead of ignoring them.
    pub relay_unknown: bool,
}

/// Session state owned by the read loop.
struct Session {
    id: ConnectionId,
    bound_name: Option<String>,
    room: Room,
    options: SessionOptions,
}

impl Session {
    async fn read_loop<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut FrameReader<R>,
    ) -> Result<(), ConnectionError> {
        while let Some(frame) = reader.next_frame().await? {
            trace!(
                conn_id = self.id,
                msg_type = frame.msg_type(),
                body_size = frame.body_size(),
                "Frame received"
            );
            self.dispatch(frame);
        }
        trace!(conn_id = self.id, "Connection closed by client");
        Ok(())
    }

    fn dispatch(&mut self, frame: MessageFrame) {
        let msg_type = match frame.message_type() {
            Some(ty @ (MessageType::BindName | MessageType::ChatInfo)) => ty,
            Some(MessageType::RoomInfo) => {
                trace!(conn_id = self.id, "Ignoring room info sent by client");
                return;
            }
            None => {
                if self.options.relay_unknown {
                    self.room.deliver(frame);
                } else {
                    trace!(
                        conn_id = self.id,
                        msg_type = frame.msg_type(),
                        "Ignoring unknown message type"
                    );
                }
                return;
            }
        };

        let result = self
            .options
            .codec
            .decode(msg_type, frame.body())
            .and_then(|payload| self.handle(payload));

        if let Err(e) = result {
            warn!(conn_id = self.id, msg_type = ?msg_type, error = %e, "Dropping malformed message");
        }
    }

    fn handle(&mut self, payload: Payload) -> Result<(), CodecError> {
        match payload {
            Payload::BindName { name } => {
                debug!(conn_id = self.id, name = %name, "Name bound");
                self.bound_name = Some(name);
            }
            Payload::ChatInfo { text } => {
                let room_info = Payload::RoomInfo {
                    name: self.bound_name.clone().unwrap_or_default(),
                    text,
                };
                let frame = self.options.codec.encode_frame(&room_info)?;
                self.room.deliver(frame);
            }
            Payload::RoomInfo { .. } => {}
        }
        Ok(())
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    mut writer: FrameWriter<W>,
    mut queue: mpsc::UnboundedReceiver<MessageFrame>,
) -> Result<(), ConnectionError> {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            debug!(conn_id = id, state = ?writer.state(), error = %e, "Write failed");
            return Err(e.into());
        }
    }
    Ok(())
}

/// A client connection bound to a room.
pub struct Connection<S> {
    id: ConnectionId,
    stream: S,
    room: Room,
    options: SessionOptions,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(id: ConnectionId, stream: S, room: Room, options: SessionOptions) -> Self {
        Self {
            id,
            stream,
            room,
            options,
        }
    }

    /// Join the room and run until the transport closes or fails.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let id = self.id;
        let (reader, writer) = tokio::io::split(self.stream);
        let mut reader = FrameReader::new(reader);
        let writer = FrameWriter::new(writer);

        let (outbox, queue) = Outbox::new();
        self.room.join(id, outbox.peer());

        let mut session = Session {
            id,
            bound_name: None,
            room: self.room,
            options: self.options,
        };

        let result = tokio::select! {
            result = session.read_loop(&mut reader) => result,
            result = write_loop(id, writer, queue) => result,
        };

        trace!(conn_id = id, read_state = ?reader.state(), "Leaving room");
        session.room.leave(id);
        drop(outbox);
        result
    }
}
