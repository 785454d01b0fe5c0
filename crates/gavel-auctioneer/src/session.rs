//! The bidder session: the bridge between one connection and one room.
//!
//! Each session runs two workers over the split transport plus a small
//! supervisor. The reader turns inbound frames into room broadcasts,
//! stamping every message with the authenticated identity. The writer
//! drains the session's send queue to the transport in FIFO order and keeps
//! the connection alive with pings. The supervisor waits for either worker
//! to exit, winds the other down, and issues the session's single
//! unregister, so the room observes exactly one departure per session no
//! matter which half fails first.

use std::{
    ops::ControlFlow,
    time::Duration,
};

use futures::{
    future::{
        self,
        Either,
    },
    SinkExt as _,
    StreamExt as _,
};
use gavel_core::{
    message::{
        Message,
        MessageKind,
    },
    primitive::UserId,
};
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{
        self,
        Instant,
        MissedTickBehavior,
    },
};
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{
    debug,
    info,
    instrument,
};

use uuid::Uuid;

use crate::{
    metrics::Metrics,
    room::{
        Departure,
        RoomHandle,
    },
    transport::{
        Connection,
        Frame,
        FrameSink,
        FrameStream,
    },
};

/// Capacity of the queue between the room loop and the writer worker.
pub(crate) const SEND_QUEUE_CAPACITY: usize = 512;

/// Largest inbound text frame the reader will try to parse. Enforced here
/// rather than on the socket, so an oversized frame is answered with an
/// invalid-json notice instead of dropping the connection.
const MAX_FRAME_BYTES: usize = 512;

const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// 90% of the read deadline, so a ping is answered before the reader
/// gives up on a silent connection.
const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Identifies one attachment of a user to a room, so a stale unregister of
/// a replaced session cannot evict its successor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SessionId(Uuid);

impl SessionId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// The room's view of one attached bidder.
///
/// The handle in the room's client map holds the only sender of the
/// session's queue: the queue is written only by the room loop, and
/// dropping the handle is the close that winds the session down.
pub(crate) struct SessionHandle {
    user_id: UserId,
    session_id: SessionId,
    queue: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub(crate) fn new(user_id: UserId, queue: mpsc::Sender<Message>) -> Self {
        Self {
            user_id,
            session_id: SessionId::random(),
            queue,
        }
    }

    pub(crate) fn user_id(&self) -> UserId {
        self.user_id
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The record the session's supervisor later unregisters with. Carries
    /// no queue sender, so an evicted session cannot hold its queue open.
    pub(crate) fn departure(&self) -> Departure {
        Departure {
            user_id: self.user_id,
            session_id: self.session_id,
        }
    }

    pub(crate) fn try_enqueue(&self, message: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.queue.try_send(message)
    }
}

/// Spawns the session's workers and returns the handle the room keys its
/// client map by. The caller still has to enqueue the handle on the room's
/// register channel.
pub(crate) fn spawn(
    user_id: UserId,
    connection: Connection,
    room: RoomHandle,
    metrics: &'static Metrics,
    tasks: &TaskTracker,
) -> SessionHandle {
    let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let handle = SessionHandle::new(user_id, queue_tx);
    let Connection {
        sink,
        stream,
    } = connection;

    let winddown = CancellationToken::new();
    let reader = Reader {
        user_id,
        stream,
        room: room.clone(),
        winddown: winddown.clone(),
    };
    let writer = Writer {
        user_id,
        sink,
        queue: queue_rx,
        winddown: winddown.clone(),
    };

    let reader_task = tasks.spawn(reader.run());
    let writer_task = tasks.spawn(writer.run());
    tasks.spawn(supervise(
        handle.departure(),
        room,
        winddown,
        reader_task,
        writer_task,
    ));

    metrics.increment_sessions_opened();
    handle
}

/// Waits for either worker to exit, winds the other down, then issues the
/// session's single unregister.
async fn supervise(
    departure: Departure,
    room: RoomHandle,
    winddown: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
) {
    let remaining = match future::select(reader, writer).await {
        Either::Left((_, writer)) => writer,
        Either::Right((_, reader)) => reader,
    };
    winddown.cancel();
    let _ = remaining.await;
    // The room may already have dropped this session (eviction, deadline,
    // or a reconnect of the same user); all of those make this a no-op.
    let _ = room.unregister(departure).await;
}

struct Reader {
    user_id: UserId,
    stream: FrameStream,
    room: RoomHandle,
    winddown: CancellationToken,
}

impl Reader {
    #[instrument(skip_all, fields(user_id = %self.user_id))]
    async fn run(mut self) {
        loop {
            let read = select! {
                biased;

                () = self.winddown.cancelled() => break,

                read = time::timeout(READ_DEADLINE, self.stream.next()) => read,
            };
            match read {
                Err(_) => {
                    info!("read deadline elapsed; dropping the connection");
                    break;
                }
                Ok(None) => {
                    info!("bidder went away");
                    break;
                }
                Ok(Some(Err(error))) => {
                    info!(%error, "failed reading from the connection");
                    break;
                }
                Ok(Some(Ok(frame))) => {
                    if self.handle_frame(frame).await.is_break() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> ControlFlow<()> {
        let message = match frame {
            // Pings are answered by the transport layer; any traffic
            // refreshes the read deadline.
            Frame::Ping(_) | Frame::Pong(_) => return ControlFlow::Continue(()),
            Frame::Close => {
                info!("bidder closed the connection");
                return ControlFlow::Break(());
            }
            Frame::Text(text) => match parse_frame(&text) {
                Ok(mut message) => {
                    // Identity comes from the session, never from the wire.
                    message.user_id = Some(self.user_id);
                    message
                }
                Err(error) => {
                    debug!(%error, "received an unparseable frame");
                    // Routed through the room so the error notice uses the
                    // same delivery path as every other per-client message.
                    Message::invalid_json()
                }
            },
        };
        if self.room.broadcast(self.user_id, message).await.is_err() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

fn parse_frame(text: &str) -> Result<Message, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len: text.len(),
        });
    }
    serde_json::from_str(text).map_err(FrameError::Malformed)
}

#[derive(Debug, thiserror::Error)]
enum FrameError {
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge { len: usize },
    #[error("frame is not a valid message")]
    Malformed(#[source] serde_json::Error),
}

struct Writer {
    user_id: UserId,
    sink: FrameSink,
    queue: mpsc::Receiver<Message>,
    winddown: CancellationToken,
}

impl Writer {
    #[instrument(skip_all, fields(user_id = %self.user_id))]
    async fn run(mut self) {
        let mut ping = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                biased;

                () = self.winddown.cancelled() => break,

                queued = self.queue.recv() => match queued {
                    // A closed queue means the room dropped this session.
                    None => break,
                    Some(message) => {
                        let terminal = message.kind == MessageKind::AuctionFinished;
                        if self.write(&message).await.is_err() {
                            break;
                        }
                        if terminal {
                            info!("auction finished; closing the connection");
                            break;
                        }
                    }
                },

                _ = ping.tick() => {
                    if self.write_frame(Frame::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        // The writer is the single owner of the sink; this is the one close
        // of the transport.
        let _ = self.sink.close().await;
    }

    async fn write(&mut self, message: &Message) -> Result<(), WriteFailed> {
        let text = serde_json::to_string(message)
            .expect("serializing a message to a string cannot fail");
        self.write_frame(Frame::Text(text)).await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), WriteFailed> {
        match time::timeout(WRITE_DEADLINE, self.sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                info!(%error, "failed writing to the connection");
                Err(WriteFailed)
            }
            Err(_) => {
                info!("write deadline elapsed; dropping the connection");
                Err(WriteFailed)
            }
        }
    }
}

#[derive(Debug)]
struct WriteFailed;
