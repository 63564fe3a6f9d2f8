//! The per-connection event loop.
//!
//! A reactor exclusively owns one stream: it runs the handshake, then loops over sending queued
//!  messages and assembling received ones until it is asked to stop or the connection fails.
//!  Application code never touches the stream; it interacts with the reactor through a
//!  [TransportHandle] (for sending and stopping) and a [ConnectionHandler] (for receiving).
//!
//! Outbound messages are sent strictly one at a time and in FIFO order, so frames are never
//!  interleaved on the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::framed_message::{FrameAssembler, FramedMessage};
use crate::tls::SessionHandshake;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReactorState {
    Created,
    Handshaking,
    Running,
    /// terminal: the connection broke or never came up
    Failed,
    /// terminal: the event loop exited because a stop was requested
    Stopped,
}

impl ReactorState {
    fn from_u8(raw: u8) -> ReactorState {
        match raw {
            0 => ReactorState::Created,
            1 => ReactorState::Handshaking,
            2 => ReactorState::Running,
            3 => ReactorState::Failed,
            _ => ReactorState::Stopped,
        }
    }
}

/// Receives a connection's inbound events. The callbacks are invoked on the reactor's task, so
///  they must not block: anything expensive belongs on another task.
#[cfg_attr(test, automock)]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// called for every complete inbound frame, in arrival order
    fn on_message_arrived(&self, message: FramedMessage);

    /// called exactly once if the connection fails, after which no more messages arrive
    fn on_connection_failed(&self, error: &TransportError);

    /// called after the handshake completed and before the first message is exchanged
    fn before_event_loop(&self) {}

    /// called exactly once if the reactor exits because a stop was requested
    fn on_connection_stopped(&self) {}
}

struct Shared {
    outbound: Mutex<VecDeque<FramedMessage>>,
    wakeup: Notify,
    state_changed: Notify,
    stop_requested: AtomicBool,
    state: AtomicU8,
    config: Arc<TransportConfig>,
}

/// The application's side of a reactor: enqueueing messages, requesting a stop, and observing
///  the connection's state. Handles are cheap to clone and can be used from any thread.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl TransportHandle {
    pub fn new(config: Arc<TransportConfig>) -> TransportHandle {
        TransportHandle {
            shared: Arc::new(Shared {
                outbound: Default::default(),
                wakeup: Notify::new(),
                state_changed: Notify::new(),
                stop_requested: AtomicBool::new(false),
                state: AtomicU8::new(ReactorState::Created as u8),
                config,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Appends a message to the outbound queue and wakes the event loop. This returns
    ///  immediately: there is no confirmation that the message was actually sent.
    pub fn enqueue_send(&self, message: FramedMessage) -> Result<(), TransportError> {
        let len = message.payload.len() as u64;
        if len > self.shared.config.max_payload_len {
            return Err(TransportError::FrameTooLarge { len, max: self.shared.config.max_payload_len });
        }
        if self.is_finished() {
            return Err(TransportError::ConnectionLost);
        }

        trace!("enqueueing message #{} with {} bytes", message.id, len);
        lock(&self.shared.outbound).push_back(message);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Asks the event loop to exit at its next iteration. Messages that are queued or partially
    ///  sent at that point are discarded.
    pub fn request_stop(&self) {
        debug!("stop requested");
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        self.shared.state_changed.notify_waiters();
    }

    pub fn state(&self) -> ReactorState {
        ReactorState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ReactorState::Failed
    }

    /// true once the connection failed or a stop was requested
    pub fn is_finished(&self) -> bool {
        self.is_stop_requested() || matches!(self.state(), ReactorState::Failed | ReactorState::Stopped)
    }

    /// Waits until [TransportHandle::is_finished] becomes true
    pub async fn finished(&self) {
        loop {
            let notified = self.shared.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the handshake to complete, returning false if the connection failed or was
    ///  stopped before the event loop started
    pub async fn established(&self) -> bool {
        loop {
            let notified = self.shared.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_finished() {
                return false;
            }
            if self.state() == ReactorState::Running {
                return true;
            }
            notified.await;
        }
    }

    fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ReactorState) {
        trace!("reactor state {:?}", state);
        self.shared.state.store(state as u8, Ordering::Release);
        self.shared.state_changed.notify_waiters();
    }

    fn fail(&self, handler: &dyn ConnectionHandler, error: TransportError) {
        warn!("connection failed: {}", error);
        self.set_state(ReactorState::Failed);
        handler.on_connection_failed(&error);
    }

    fn stop(&self, handler: &dyn ConnectionHandler) {
        info!("connection stopped");
        self.set_state(ReactorState::Stopped);
        handler.on_connection_stopped();
    }

    fn next_outbound(&self) -> Option<FramedMessage> {
        lock(&self.shared.outbound).pop_front()
    }
}

/// Starts a reactor on its own task. The task runs in the caller's tracing span and finishes
///  once the connection is failed or stopped.
pub fn spawn_reactor<S, H>(
    raw: S,
    handshake: Arc<H>,
    handle: TransportHandle,
    handler: Arc<dyn ConnectionHandler>,
) -> JoinHandle<()>
where
    S: Send + 'static,
    H: SessionHandshake<S>,
{
    tokio::spawn(run_reactor(raw, handshake, handle, handler).instrument(Span::current()))
}

async fn run_reactor<S, H>(raw: S, handshake: Arc<H>, handle: TransportHandle, handler: Arc<dyn ConnectionHandler>)
where
    S: Send + 'static,
    H: SessionHandshake<S>,
{
    let io_timeout = handle.config().io_timeout;

    if handle.is_stop_requested() {
        debug!("stopped before the handshake");
        return handle.stop(handler.as_ref());
    }

    handle.set_state(ReactorState::Handshaking);
    let session = match timeout(io_timeout, handshake.handshake(raw)).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return handle.fail(handler.as_ref(), e),
        Err(_) => return handle.fail(handler.as_ref(), TransportError::Handshake(format!("no handshake within {:?}", io_timeout))),
    };

    handler.before_event_loop();
    handle.set_state(ReactorState::Running);
    info!("connection established");

    let (mut reader, mut writer) = tokio::io::split(session);
    let result = event_loop(&mut reader, &mut writer, &handle, handler.as_ref()).await;
    let failed = result.is_err();
    if let Err(e) = result {
        handle.fail(handler.as_ref(), e);
    }

    match timeout(io_timeout, writer.shutdown()).await {
        Ok(Ok(())) => trace!("session shut down"),
        Ok(Err(e)) => debug!("error shutting down session: {}", e),
        Err(_) => debug!("timeout shutting down session"),
    }

    if !failed {
        handle.stop(handler.as_ref());
    }
}

async fn event_loop<R, W>(reader: &mut R, writer: &mut W, handle: &TransportHandle, handler: &dyn ConnectionHandler) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = handle.config();
    let mut assembler = FrameAssembler::new(config.max_payload_len);

    let mut send_buf: Vec<u8> = Vec::new();
    let mut send_cursor = 0;
    let mut needs_flush = false;

    loop {
        if handle.is_stop_requested() {
            return Ok(());
        }

        if send_buf.is_empty() {
            if let Some(message) = handle.next_outbound() {
                trace!("starting to send message #{}", message.id);
                send_buf = message.to_wire();
                send_cursor = 0;
            }
        }
        let is_sending = !send_buf.is_empty();

        tokio::select! {
            _ = handle.shared.wakeup.notified() => {
                trace!("woken up");
            }
            read_result = reader.read(assembler.unfilled()) => {
                let num_read = read_result?;
                if num_read == 0 {
                    return Err(TransportError::ConnectionClosed);
                }
                if let Some(message) = assembler.advance(num_read)? {
                    trace!("received message #{} with {} bytes", message.id, message.payload.len());
                    handler.on_message_arrived(message);
                }
            }
            write_result = write_or_flush(writer, &send_buf[send_cursor..]), if is_sending || needs_flush => {
                let num_written = write_result?;
                if !is_sending {
                    needs_flush = false;
                    continue;
                }
                if num_written == 0 {
                    return Err(TransportError::ConnectionClosed);
                }
                send_cursor += num_written;
                if send_cursor == send_buf.len() {
                    trace!("finished sending message");
                    send_buf.clear();
                    send_cursor = 0;
                    needs_flush = true;
                }
            }
            _ = tokio::time::sleep(config.io_timeout) => {
                return Err(TransportError::Timeout(config.io_timeout));
            }
        }
    }
}

/// Writes as much of `pending` as the stream accepts, or flushes the stream if nothing is pending
async fn write_or_flush<W: AsyncWrite + Unpin>(writer: &mut W, pending: &[u8]) -> std::io::Result<usize> {
    if pending.is_empty() {
        writer.flush().await?;
        return Ok(0);
    }
    writer.write(pending).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tls::NoEncryption;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// forwards inbound events to channels so tests can await them
    pub(crate) struct RecordingHandler {
        messages: mpsc::UnboundedSender<FramedMessage>,
        failures: mpsc::UnboundedSender<String>,
    }

    impl RecordingHandler {
        pub(crate) fn new() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<FramedMessage>, mpsc::UnboundedReceiver<String>) {
            let (messages, messages_rx) = mpsc::unbounded_channel();
            let (failures, failures_rx) = mpsc::unbounded_channel();
            (Arc::new(RecordingHandler { messages, failures }), messages_rx, failures_rx)
        }
    }

    impl ConnectionHandler for RecordingHandler {
        fn on_message_arrived(&self, message: FramedMessage) {
            self.messages.send(message).ok();
        }

        fn on_connection_failed(&self, error: &TransportError) {
            self.failures.send(error.to_string()).ok();
        }
    }

    fn config(io_timeout: Duration) -> Arc<TransportConfig> {
        Arc::new(TransportConfig {
            io_timeout,
            max_payload_len: 1024,
        })
    }

    fn start(duplex_capacity: usize, io_timeout: Duration, handler: Arc<dyn ConnectionHandler>) -> (TransportHandle, JoinHandle<()>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(duplex_capacity);
        let handle = TransportHandle::new(config(io_timeout));
        let join_handle = spawn_reactor(local, Arc::new(NoEncryption), handle.clone(), handler);
        (handle, join_handle, remote)
    }

    fn mock_without_failure() -> MockConnectionHandler {
        let mut handler = MockConnectionHandler::new();
        handler.expect_before_event_loop().times(1).return_const(());
        handler.expect_on_connection_failed().never();
        handler.expect_on_connection_stopped().times(1).return_const(());
        handler
    }

    #[tokio::test]
    async fn test_receive_byte_by_byte() {
        let (handler, mut messages, _failures) = RecordingHandler::new();
        let (handle, join_handle, mut remote) = start(1, Duration::from_secs(5), handler);

        let first = FramedMessage::new(1, b"abc".to_vec());
        let second = FramedMessage::new(2, vec![]);
        let third = FramedMessage::new(3, vec![9; 100]);
        for msg in [&first, &second, &third] {
            remote.write_all(&msg.to_wire()).await.unwrap();
        }

        assert_eq!(messages.recv().await, Some(first));
        assert_eq!(messages.recv().await, Some(second));
        assert_eq!(messages.recv().await, Some(third));

        handle.request_stop();
        join_handle.await.unwrap();
        assert_eq!(handle.state(), ReactorState::Stopped);
    }

    #[tokio::test]
    async fn test_send_in_fifo_order() {
        let (handler, _messages, _failures) = RecordingHandler::new();
        let (handle, join_handle, mut remote) = start(7, Duration::from_secs(5), handler);

        let messages = vec![
            FramedMessage::new(10, b"first".to_vec()),
            FramedMessage::new(11, vec![1; 300]),
            FramedMessage::new(12, b"third".to_vec()),
        ];
        for msg in &messages {
            handle.enqueue_send(msg.clone()).unwrap();
        }

        let expected: Vec<u8> = messages.iter().flat_map(|m| m.to_wire()).collect();
        let mut actual = vec![0u8; expected.len()];
        remote.read_exact(&mut actual).await.unwrap();
        assert_eq!(actual, expected);

        handle.request_stop();
        join_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_does_not_report_failure() {
        let (handle, join_handle, _remote) = start(64, Duration::from_secs(5), Arc::new(mock_without_failure()));

        handle.request_stop();
        handle.finished().await;
        join_handle.await.unwrap();

        assert_eq!(handle.state(), ReactorState::Stopped);
        assert!(!handle.is_failed());
        assert!(matches!(handle.enqueue_send(FramedMessage::new(1, vec![])), Err(TransportError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_stop_before_handshake() {
        let mut handler = MockConnectionHandler::new();
        handler.expect_before_event_loop().never();
        handler.expect_on_connection_failed().never();
        handler.expect_on_connection_stopped().times(1).return_const(());

        let (local, _remote) = tokio::io::duplex(64);
        let handle = TransportHandle::new(config(Duration::from_secs(5)));
        handle.request_stop();
        spawn_reactor(local, Arc::new(FailingHandshake), handle.clone(), Arc::new(handler)).await.unwrap();

        assert_eq!(handle.state(), ReactorState::Stopped);
    }

    #[tokio::test]
    async fn test_peer_close_fails_connection() {
        let mut handler = MockConnectionHandler::new();
        handler.expect_before_event_loop().times(1).return_const(());
        handler.expect_on_connection_stopped().never();
        handler.expect_on_connection_failed()
            .withf(|e| matches!(e, TransportError::ConnectionClosed))
            .times(1)
            .return_const(());

        let (handle, join_handle, remote) = start(64, Duration::from_secs(5), Arc::new(handler));
        drop(remote);

        join_handle.await.unwrap();
        assert_eq!(handle.state(), ReactorState::Failed);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_connection() {
        let (handler, _messages, mut failures) = RecordingHandler::new();
        let (handle, join_handle, _remote) = start(64, Duration::from_millis(50), handler);

        let failure = failures.recv().await.unwrap();
        assert!(failure.contains("no socket readiness"), "{}", failure);
        join_handle.await.unwrap();
        assert!(handle.is_failed());
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_connection() {
        let (handler, _messages, mut failures) = RecordingHandler::new();
        let (handle, join_handle, mut remote) = start(64, Duration::from_secs(5), handler);

        let mut header: Vec<u8> = Vec::new();
        crate::framed_message::WireHeader { id: 1, payload_len: 1025 }.ser(&mut header);
        remote.write_all(&header).await.unwrap();

        let failure = failures.recv().await.unwrap();
        assert!(failure.contains("exceeds the maximum"), "{}", failure);
        join_handle.await.unwrap();
        assert!(handle.is_failed());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_oversized_payload() {
        let handle = TransportHandle::new(config(Duration::from_secs(1)));
        assert!(matches!(
            handle.enqueue_send(FramedMessage::new(1, vec![0; 1025])),
            Err(TransportError::FrameTooLarge { len: 1025, max: 1024 }),
        ));
        assert_eq!(handle.state(), ReactorState::Created);
    }

    struct FailingHandshake;

    #[async_trait]
    impl SessionHandshake<DuplexStream> for FailingHandshake {
        type Session = DuplexStream;

        async fn handshake(&self, _raw: DuplexStream) -> Result<DuplexStream, TransportError> {
            Err(TransportError::Handshake("certificate rejected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let mut handler = MockConnectionHandler::new();
        handler.expect_before_event_loop().never();
        handler.expect_on_connection_failed()
            .withf(|e| matches!(e, TransportError::Handshake(_)))
            .times(1)
            .return_const(());

        let (local, _remote) = tokio::io::duplex(64);
        let handle = TransportHandle::new(config(Duration::from_secs(5)));
        spawn_reactor(local, Arc::new(FailingHandshake), handle.clone(), Arc::new(handler)).await.unwrap();

        assert_eq!(handle.state(), ReactorState::Failed);
    }
}
