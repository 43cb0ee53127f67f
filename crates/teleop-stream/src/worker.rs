//! Isolated streaming decoder.
//!
//! [`DecoderHandle::spawn`] starts a dedicated `stream-decoder` OS thread that
//! runs its own single-threaded Tokio runtime.  The thread owns the streaming
//! WebSocket and decodes every binary frame it receives, so decode cost never
//! lands on the caller's runtime.
//!
//! The boundary is strictly message passing:
//!
//! * **In** – [`DecoderCommand`] over an unbounded channel (`Init`, `Send`,
//!   `Close`).
//! * **Out** – [`DecoderEvent`] over an unbounded channel, one
//!   [`DecoderEvent::UpdatePoints`] per binary frame, in socket order.
//!
//! Decoded buffers are moved into the event; nothing is shared with the
//! worker after it is sent.

use std::thread;

use futures_util::{SinkExt, StreamExt};
use teleop_types::{ChannelState, DecodeError, DecodedFrame, TeleopError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoding::WireEncoding;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Messages accepted by the decoder worker.
#[derive(Debug, Clone)]
pub enum DecoderCommand {
    /// Connect to `endpoint` and decode with the encoding named `encoding`.
    ///
    /// Replaces any previous socket and encoding; the old socket is closed
    /// first.
    Init { endpoint: String, encoding: String },
    /// Forward raw bytes to the server. Dropped when no socket is open.
    Send(Vec<u8>),
    /// Close the current socket.
    Close,
}

/// Messages emitted by the decoder worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    ConnectionState(ChannelState),
    UpdatePoints(DecodedFrame),
    Error(DecodeError),
}

/// Owner-side handle to the decoder thread.
///
/// Dropping the handle terminates the worker.
pub struct DecoderHandle {
    commands: mpsc::UnboundedSender<DecoderCommand>,
    cancel: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl DecoderHandle {
    /// Start the worker thread.
    ///
    /// Returns the handle and the receiving end of the worker's event stream.
    pub fn spawn() -> Result<(Self, mpsc::UnboundedReceiver<DecoderEvent>), TeleopError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = StreamWorker {
            commands: command_rx,
            events: event_tx,
            cancel: cancel.clone(),
            encoding: Ok(WireEncoding::default()),
            socket: None,
        };

        let thread = thread::Builder::new()
            .name("stream-decoder".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(worker.run()),
                    Err(e) => error!(error = %e, "failed to build decoder runtime"),
                }
            })?;

        Ok((
            Self {
                commands: command_tx,
                cancel,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    /// (Re)initialise the streaming socket.  Returns `false` once the worker
    /// has exited.
    pub fn init(&self, endpoint: impl Into<String>, encoding: impl Into<String>) -> bool {
        self.command(DecoderCommand::Init {
            endpoint: endpoint.into(),
            encoding: encoding.into(),
        })
    }

    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.command(DecoderCommand::Send(bytes))
    }

    pub fn close(&self) -> bool {
        self.command(DecoderCommand::Close)
    }

    fn command(&self, command: DecoderCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Stop the worker.  Returns immediately; the thread closes its socket
    /// and exits on its own.  Safe to call more than once.
    pub fn terminate(&mut self) {
        self.cancel.cancel();
        // Detach: joining here would block an async caller.
        self.thread.take();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// The actor living on the decoder thread.
struct StreamWorker {
    commands: mpsc::UnboundedReceiver<DecoderCommand>,
    events: mpsc::UnboundedSender<DecoderEvent>,
    cancel: CancellationToken,
    encoding: Result<WireEncoding, DecodeError>,
    socket: Option<WsStream>,
}

impl StreamWorker {
    async fn run(mut self) {
        debug!("stream decoder started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(DecoderCommand::Init { endpoint, encoding }) => {
                        self.init(endpoint, encoding).await;
                    }
                    Some(DecoderCommand::Send(bytes)) => self.send(bytes).await,
                    Some(DecoderCommand::Close) => {
                        if self.close_socket().await {
                            self.emit(DecoderEvent::ConnectionState(ChannelState::Closed));
                        }
                    }
                    None => break,
                },
                message = next_message(&mut self.socket) => self.on_message(message),
            }
        }
        self.close_socket().await;
        debug!("stream decoder stopped");
    }

    async fn init(&mut self, endpoint: String, encoding: String) {
        // Replaced sockets are closed silently; the new attempt reports its
        // own state.
        self.close_socket().await;

        self.encoding = encoding.parse::<WireEncoding>();
        if let Err(e) = &self.encoding {
            warn!(error = %e, "streaming channel configured with unknown encoding");
        }

        self.emit(DecoderEvent::ConnectionState(ChannelState::Connecting));
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = connect_async(endpoint.as_str()) => result,
        };

        match connected {
            Ok((socket, _)) => {
                info!(endpoint = %endpoint, "streaming socket connected");
                self.socket = Some(socket);
                self.emit(DecoderEvent::ConnectionState(ChannelState::Open));
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "streaming socket connect failed");
                self.emit(DecoderEvent::ConnectionState(ChannelState::Error));
                self.emit(DecoderEvent::ConnectionState(ChannelState::Closed));
            }
        }
    }

    async fn send(&mut self, bytes: Vec<u8>) {
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = socket.send(Message::Binary(bytes.into())).await {
                warn!(error = %e, "streaming socket send failed");
            }
        }
    }

    /// Returns `true` when a socket was actually open.
    async fn close_socket(&mut self) -> bool {
        match self.socket.take() {
            Some(mut socket) => {
                let _ = socket.close(None).await;
                true
            }
            None => false,
        }
    }

    fn on_message(
        &mut self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match message {
            Some(Ok(Message::Binary(data))) => {
                let event = match &self.encoding {
                    Ok(encoding) => DecoderEvent::UpdatePoints(encoding.decode(&data)),
                    Err(e) => DecoderEvent::Error(e.clone()),
                };
                self.emit(event);
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("streaming socket closed by peer");
                self.socket = None;
                self.emit(DecoderEvent::ConnectionState(ChannelState::Closed));
            }
            Some(Err(e)) => {
                warn!(error = %e, "streaming socket error");
                self.socket = None;
                self.emit(DecoderEvent::ConnectionState(ChannelState::Error));
                self.emit(DecoderEvent::ConnectionState(ChannelState::Closed));
            }
            Some(Ok(_)) => {}
        }
    }

    fn emit(&self, event: DecoderEvent) {
        if self.events.send(event).is_err() {
            // Nobody is listening any more.
            self.cancel.cancel();
        }
    }
}

async fn next_message(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use teleop_types::Positions;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DecoderEvent>) -> DecoderEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for decoder event")
            .expect("decoder event stream closed")
    }

    /// Serve `frames` to the first client, then hold the connection open.
    async fn serve_frames(frames: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Binary(frame.into())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        });
        format!("ws://{addr}")
    }

    fn rgb16_frame(points: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        for i in 0..points {
            for v in [i as i16, 0, -(i as i16)] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf.extend(std::iter::repeat_n(0xFFu8, points * 2));
        buf
    }

    #[tokio::test]
    async fn decodes_frames_in_arrival_order() {
        let url = serve_frames(vec![rgb16_frame(1), rgb16_frame(2), rgb16_frame(3)]).await;
        let (decoder, mut events) = DecoderHandle::spawn().unwrap();
        assert!(decoder.init(url, "XYZ_RGB16_i16"));

        assert_eq!(
            next_event(&mut events).await,
            DecoderEvent::ConnectionState(ChannelState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            DecoderEvent::ConnectionState(ChannelState::Open)
        );
        for expected in 1..=3 {
            match next_event(&mut events).await {
                DecoderEvent::UpdatePoints(frame) => {
                    assert_eq!(frame.point_count(), expected);
                    assert!(matches!(frame.positions, Positions::I16(_)));
                    assert_eq!(frame.colors[..4], [255, 255, 255, 255]);
                }
                other => panic!("expected UpdatePoints, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unknown_encoding_reports_error_and_keeps_running() {
        let url = serve_frames(vec![vec![0; 16], vec![0; 32]]).await;
        let (decoder, mut events) = DecoderHandle::spawn().unwrap();
        decoder.init(url, "XYZ_RGBA_f64");

        let _connecting = next_event(&mut events).await;
        let _open = next_event(&mut events).await;
        for _ in 0..2 {
            assert_eq!(
                next_event(&mut events).await,
                DecoderEvent::Error(DecodeError::UnknownEncoding("XYZ_RGBA_f64".to_string()))
            );
        }
        assert!(!decoder.is_terminated());
    }

    #[tokio::test]
    async fn failed_connect_reports_error_then_closed() {
        // Grab a free port and release it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (decoder, mut events) = DecoderHandle::spawn().unwrap();
        decoder.init(format!("ws://{addr}"), "XYZ_RGBA_f32");

        assert_eq!(
            next_event(&mut events).await,
            DecoderEvent::ConnectionState(ChannelState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            DecoderEvent::ConnectionState(ChannelState::Error)
        );
        assert_eq!(
            next_event(&mut events).await,
            DecoderEvent::ConnectionState(ChannelState::Closed)
        );
    }

    #[tokio::test]
    async fn terminate_ends_event_stream() {
        let (mut decoder, mut events) = DecoderHandle::spawn().unwrap();
        decoder.terminate();
        decoder.terminate();

        let end = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("worker did not exit");
        assert!(end.is_none());
        assert!(!decoder.init("ws://127.0.0.1:1", "XYZ_RGBA_f32"));
    }
}
