//! The duplex frame transport between a bidder's connection and its session.
//!
//! The HTTP layer owns the upgrade handshake; the engine only ever sees an
//! already-split pair of boxed sink/stream halves carrying [`Frame`]s. That
//! keeps the session workers independent of the upgrade machinery and lets
//! tests drive a session over an in-process duplex.

use std::pin::Pin;

use axum::extract::ws::{
    self,
    WebSocket,
};
use eyre::Report;
use futures::{
    Sink,
    SinkExt as _,
    Stream,
    StreamExt as _,
};

/// One message frame on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub(crate) type FrameSink = Pin<Box<dyn Sink<Frame, Error = Report> + Send>>;
pub(crate) type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, Report>> + Send>>;

/// The two halves of one bidder connection.
pub(crate) struct Connection {
    pub(crate) sink: FrameSink,
    pub(crate) stream: FrameStream,
}

impl Connection {
    /// Wraps an upgraded websocket.
    pub(crate) fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(Report::new)
            .with(|frame: Frame| futures::future::ready(Ok::<_, Report>(frame_to_ws(frame))));
        let stream = stream.map(|result| result.map(ws_to_frame).map_err(Report::new));
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// An in-process connection pair; frames sent into one end come out of
    /// the other. Closing a sink ends the peer's stream.
    #[cfg(test)]
    pub(crate) fn duplex() -> (Self, Self) {
        let (north_tx, north_rx) = futures::channel::mpsc::unbounded();
        let (south_tx, south_rx) = futures::channel::mpsc::unbounded();
        let near = Self {
            sink: Box::pin(north_tx.sink_map_err(Report::new)),
            stream: Box::pin(south_rx.map(Ok)),
        };
        let far = Self {
            sink: Box::pin(south_tx.sink_map_err(Report::new)),
            stream: Box::pin(north_rx.map(Ok)),
        };
        (near, far)
    }
}

fn frame_to_ws(frame: Frame) -> ws::Message {
    match frame {
        Frame::Text(text) => ws::Message::Text(text),
        Frame::Ping(payload) => ws::Message::Ping(payload),
        Frame::Pong(payload) => ws::Message::Pong(payload),
        Frame::Close => ws::Message::Close(None),
    }
}

fn ws_to_frame(message: ws::Message) -> Frame {
    match message {
        ws::Message::Text(text) => Frame::Text(text),
        // Binary frames are not part of the protocol; hand them to the
        // reader as text so it answers with an invalid-json notice.
        ws::Message::Binary(payload) => Frame::Text(String::from_utf8_lossy(&payload).into_owned()),
        ws::Message::Ping(payload) => Frame::Ping(payload),
        ws::Message::Pong(payload) => Frame::Pong(payload),
        ws::Message::Close(_) => Frame::Close,
    }
}
