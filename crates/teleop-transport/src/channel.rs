//! Reconnecting WebSocket supervisor for the JSON channels.
//!
//! One [`supervise`] task per channel owns the socket for its whole life:
//! connect, pump frames both ways while open, and after any close or error
//! wait the reconnect interval and start over.  Each connection gets a fresh
//! outbound queue; nothing written while the channel is down is kept.
//!
//! Once its token is cancelled a task stops writing the shared state and
//! outbound slot.  The owner publishes the final `Closed`, and a newer
//! session may already be using the same slots.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use teleop_types::{ChannelKind, ChannelState};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sender half of the currently open connection, if any.
pub(crate) type Outbound = watch::Sender<Option<mpsc::UnboundedSender<Message>>>;

/// Per-channel reaction to socket traffic.
pub(crate) trait ChannelHandler: Send + 'static {
    /// Called once per successful connection, before any inbound message.
    fn on_open(&mut self, _outbound: &mpsc::UnboundedSender<Message>) {}

    fn on_text(&mut self, text: &str);
}

/// Everything one supervisor task needs.
pub(crate) struct ChannelTask<H> {
    pub kind: ChannelKind,
    pub url: String,
    pub reconnect_interval: Duration,
    pub state: watch::Sender<ChannelState>,
    pub outbound: Outbound,
    pub cancel: CancellationToken,
    pub handler: H,
}

enum Ending {
    Closed,
    Failed,
    Shutdown,
}

/// Run the connect / pump / back-off cycle until cancelled.
pub(crate) async fn supervise<H: ChannelHandler>(mut task: ChannelTask<H>) {
    let kind = task.kind;
    while !task.cancel.is_cancelled() {
        publish(&task.state, &task.cancel, ChannelState::Connecting);
        debug!(channel = %kind, url = %task.url, "connecting");

        let connected = tokio::select! {
            _ = task.cancel.cancelled() => break,
            result = connect_async(task.url.as_str()) => result,
        };

        let ending = match connected {
            Ok((socket, _)) => {
                info!(channel = %kind, url = %task.url, "channel open");
                pump(&mut task, socket).await
            }
            Err(e) => {
                warn!(channel = %kind, error = %e, "connect failed");
                Ending::Failed
            }
        };

        match ending {
            Ending::Shutdown => break,
            Ending::Failed => {
                publish(&task.state, &task.cancel, ChannelState::Error);
                publish(&task.state, &task.cancel, ChannelState::Closed);
            }
            Ending::Closed => {
                publish(&task.state, &task.cancel, ChannelState::Closed);
            }
        }

        info!(
            channel = %kind,
            retry_in_ms = task.reconnect_interval.as_millis() as u64,
            "channel down, scheduling reconnect"
        );
        tokio::select! {
            _ = task.cancel.cancelled() => break,
            _ = tokio::time::sleep(task.reconnect_interval) => {}
        }
    }
    debug!(channel = %kind, "supervisor stopped");
}

async fn pump<H: ChannelHandler>(
    task: &mut ChannelTask<H>,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Ending {
    let kind = task.kind;
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    task.handler.on_open(&tx);
    publish(&task.outbound, &task.cancel, Some(tx));
    publish(&task.state, &task.cancel, ChannelState::Open);

    let ending = loop {
        tokio::select! {
            biased;
            _ = task.cancel.cancelled() => {
                let _ = sink.close().await;
                break Ending::Shutdown;
            }
            Some(message) = rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    warn!(channel = %kind, error = %e, "send failed");
                    break Ending::Failed;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => task.handler.on_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    info!(channel = %kind, "closed by peer");
                    break Ending::Closed;
                }
                Some(Err(e)) => {
                    warn!(channel = %kind, error = %e, "socket error");
                    break Ending::Failed;
                }
                Some(Ok(_)) => {}
            },
        }
    };

    // The queue dies with this connection.
    publish(&task.outbound, &task.cancel, None);
    ending
}

/// Store `value` in `slot` unless `cancel` has fired.
///
/// The check runs under the watch lock, so a write either lands before the
/// owner's shutdown write or not at all.
pub(crate) fn publish<T>(slot: &watch::Sender<T>, cancel: &CancellationToken, value: T) -> bool {
    slot.send_if_modified(|current| {
        if cancel.is_cancelled() {
            return false;
        }
        *current = value;
        true
    })
}

/// Hand `message` to the open connection behind `outbound`.
pub(crate) fn send_on(outbound: &Outbound, message: Message) -> bool {
    outbound
        .borrow()
        .as_ref()
        .is_some_and(|tx| tx.send(message).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct Recorder {
        greeting: Option<&'static str>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelHandler for Recorder {
        fn on_open(&mut self, outbound: &mpsc::UnboundedSender<Message>) {
            if let Some(g) = self.greeting {
                let _ = outbound.send(Message::Text(g.to_string().into()));
            }
        }

        fn on_text(&mut self, text: &str) {
            self.seen.lock().unwrap().push(text.to_string());
        }
    }

    fn task(url: String, handler: Recorder) -> (ChannelTask<Recorder>, watch::Receiver<ChannelState>) {
        let (state, state_rx) = watch::channel(ChannelState::Initializing);
        let (outbound, _) = watch::channel(None);
        (
            ChannelTask {
                kind: ChannelKind::Control,
                url,
                reconnect_interval: Duration::from_millis(50),
                state,
                outbound,
                cancel: CancellationToken::new(),
                handler,
            },
            state_rx,
        )
    }

    async fn wait_for(rx: &mut watch::Receiver<ChannelState>, want: ChannelState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for channel state")
            .expect("state sender dropped");
    }

    #[tokio::test]
    async fn greets_on_open_and_forwards_text() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("hello back".to_string().into())).await.unwrap();
            first.into_text().unwrap().as_str().to_string()
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (t, _state) = task(
            url,
            Recorder {
                greeting: Some("hi"),
                seen: Arc::clone(&seen),
            },
        );
        let cancel = t.cancel.clone();
        let handle = tokio::spawn(supervise(t));

        assert_eq!(server.await.unwrap(), "hi");
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("inbound text never arrived");
        assert_eq!(seen.lock().unwrap()[0], "hello back");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(Mutex::new(0usize));
        let count = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                *count.lock().unwrap() += 1;
                let mut ws = accept_async(stream).await.unwrap();
                // First connection is dropped straight away, later ones stay.
                if *count.lock().unwrap() == 1 {
                    let _ = ws.close(None).await;
                } else {
                    tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });
                }
            }
        });

        let (t, mut state) = task(
            url,
            Recorder {
                greeting: None,
                seen: Arc::default(),
            },
        );
        let cancel = t.cancel.clone();
        let outbound = t.outbound.subscribe();
        let handle = tokio::spawn(supervise(t));

        wait_for(&mut state, ChannelState::Closed).await;
        wait_for(&mut state, ChannelState::Open).await;
        assert_eq!(*accepted.lock().unwrap(), 2);
        assert!(outbound.borrow().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn keeps_retrying_until_server_appears() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (t, mut state) = task(
            format!("ws://{addr}"),
            Recorder {
                greeting: None,
                seen: Arc::default(),
            },
        );
        let cancel = t.cancel.clone();
        let handle = tokio::spawn(supervise(t));

        // Nothing is listening yet: the first attempt fails and backs off.
        wait_for(&mut state, ChannelState::Closed).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        wait_for(&mut state, ChannelState::Open).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retries_at_a_fixed_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Drop every connection before the handshake so each attempt fails.
            while let Ok((stream, _)) = listener.accept().await {
                let _ = accepted_tx.send(tokio::time::Instant::now());
                drop(stream);
            }
        });

        let (mut t, _state) = task(
            url,
            Recorder {
                greeting: None,
                seen: Arc::default(),
            },
        );
        let interval = Duration::from_millis(200);
        t.reconnect_interval = interval;
        let cancel = t.cancel.clone();
        let handle = tokio::spawn(supervise(t));

        let mut attempts = Vec::new();
        for _ in 0..3 {
            let at = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
                .await
                .expect("no reconnect attempt")
                .expect("server gone");
            attempts.push(at);
        }
        cancel.cancel();
        handle.await.unwrap();

        for pair in attempts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= interval, "retried after {gap:?}");
            // A doubling back-off would reach twice the interval.
            assert!(gap < interval * 2, "retried after {gap:?}");
        }
    }

    #[tokio::test]
    async fn cancelled_supervisor_leaves_newer_session_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (t, mut state) = task(
            url,
            Recorder {
                greeting: None,
                seen: Arc::default(),
            },
        );
        let state_slot = t.state.clone();
        let outbound_slot = t.outbound.clone();
        let cancel = t.cancel.clone();
        let handle = tokio::spawn(supervise(t));
        wait_for(&mut state, ChannelState::Open).await;

        // The owner shuts down and a new session starts on the same slots
        // before the old task has wound down.
        cancel.cancel();
        let (next_tx, _next_rx) = mpsc::unbounded_channel();
        state_slot.send_replace(ChannelState::Connecting);
        outbound_slot.send_replace(Some(next_tx));
        handle.await.unwrap();

        assert_eq!(*state.borrow(), ChannelState::Connecting);
        assert!(send_on(&outbound_slot, Message::Text("still here".to_string().into())));
    }

    #[test]
    fn publish_after_cancel_is_ignored() {
        let (slot, rx) = watch::channel(ChannelState::Open);
        let cancel = CancellationToken::new();
        assert!(publish(&slot, &cancel, ChannelState::Connecting));
        cancel.cancel();
        assert!(!publish(&slot, &cancel, ChannelState::Closed));
        assert_eq!(*rx.borrow(), ChannelState::Connecting);
    }

    #[test]
    fn send_on_closed_channel_is_dropped() {
        let (outbound, _) = watch::channel(None);
        assert!(!send_on(&outbound, Message::Text("x".to_string().into())));
    }
}
