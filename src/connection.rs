//! Network connection.
//!
//! Owns the live transport and the two loops around it: a read loop that
//! decodes inbound frames and forwards them upward, and a heartbeat loop
//! that sends a keep-alive once the link has been idle past the ping
//! interval. Transport failures feed one reconnection path: bounded
//! attempts with a linearly growing delay, ending in a single permanent
//! failure event when the bound is hit.
//!
//! All sends funnel through one mutexed sink half, so frames hit the wire
//! in call order. Both loops are cancelled cooperatively through a token
//! and awaited before the transport is released.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, StackError, TimeoutError};
use crate::layer::Layer;
use crate::request::PendingRequests;
use crate::transport::{Dialer, Frame, TransportSink, TransportStream};
use crate::types::{Message, StackEvent, TagGenerator};
use crate::wire::{legacy, Serializer, HEADER_LEN};
use crate::EventHub;

struct Inner {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    serializer: Serializer,
    events: EventHub,
    pending: Arc<PendingRequests>,
    tags: TagGenerator,
    connected: AtomicBool,
    shutdown: AtomicBool,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
    last_activity: Mutex<Instant>,
    cancel: Mutex<CancellationToken>,
    writer: tokio::sync::Mutex<Option<TransportSink>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

/// Handle to one connection. Clones share the same state, so the loops and
/// callers can all hold one.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        serializer: Serializer,
        events: EventHub,
        pending: Arc<PendingRequests>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                serializer,
                events,
                pending,
                tags: TagGenerator::new(),
                connected: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                last_activity: Mutex::new(Instant::now()),
                cancel: Mutex::new(CancellationToken::new()),
                writer: tokio::sync::Mutex::new(None),
                tasks: tokio::sync::Mutex::new(Vec::new()),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Tag generator shared with whoever builds requests over this
    /// connection.
    pub fn tags(&self) -> &TagGenerator {
        &self.inner.tags
    }

    /// Establish the transport and start the loops. An already connected
    /// connection is reset first.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            debug!("connect on a live connection; resetting first");
            self.disconnect().await;
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.establish(false, 0).await
    }

    /// Cancel the loops, await them, and close the transport. Safe to call
    /// when already disconnected; also aborts an in-flight reconnection.
    /// Transport failures racing this call do not restart the connection.
    pub async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.current_cancel().cancel();
        self.join_tasks().await;
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            sink.close().await;
        }
        self.inner.pending.cancel_all();
        debug!("connection closed");
    }

    /// Write one message to the wire. Frames go out in call order; the
    /// sink is held for the duration of the write.
    ///
    /// A transport error starts the reconnection path and is also returned
    /// to the caller.
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let frame = self
            .inner
            .serializer
            .serialize_auto(message)
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;

        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
        match sink.send(Frame::Binary(frame)).await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(err) => {
                drop(writer);
                self.begin_failure(&err);
                Err(err)
            }
        }
    }

    /// Next decoded inbound message, bounded by `timeout` (the configured
    /// read timeout when `None`).
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Message, StackError> {
        let bound = timeout.unwrap_or_else(|| self.inner.config.timeout());
        let mut rx = self.inner.inbound_rx.lock().await;

        match rx.try_recv() {
            Ok(message) => return Ok(message),
            Err(mpsc::error::TryRecvError::Empty) if !self.is_connected() => {
                return Err(ConnectionError::Closed.into());
            }
            Err(_) => {}
        }

        match tokio::time::timeout(bound, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ConnectionError::Closed.into()),
            Err(_) => Err(TimeoutError(bound).into()),
        }
    }

    /// Next inbound message with no bound; `None` once the connection is
    /// torn down with nothing queued. Used by the stack's dispatch task.
    pub async fn next_inbound(&self) -> Option<Message> {
        self.inner.inbound_rx.lock().await.recv().await
    }

    async fn establish(&self, reconnect: bool, attempts: u32) -> Result<(), ConnectionError> {
        let timeout = self.inner.config.timeout();
        let transport = tokio::time::timeout(timeout, self.inner.dialer.dial(&self.inner.config))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(timeout))??;

        let (sink, stream) = transport.split();
        *self.inner.writer.lock().await = Some(sink);

        let cancel = CancellationToken::new();
        *lock_or_panic(&self.inner.cancel) = cancel.clone();

        self.touch();
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);

        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(tokio::spawn(
            self.clone().read_loop(stream, cancel.clone()),
        ));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop(cancel)));
        drop(tasks);

        if reconnect {
            info!("reconnected after {} attempt(s)", attempts);
            self.inner.events.emit(StackEvent::Reconnected { attempts });
        } else {
            info!("connected to {}", self.inner.config.endpoint);
            self.inner.events.emit(StackEvent::Connected { reconnect: false });
        }
        Ok(())
    }

    async fn read_loop(self, mut stream: TransportStream, cancel: CancellationToken) {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("read loop cancelled");
                    return;
                }
                frame = stream.next() => frame,
            };

            match frame {
                Ok(Some(Frame::Binary(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    self.drain_frames(&mut buffer);
                }
                Ok(Some(Frame::Text(text))) => match legacy::decode(&text) {
                    Ok((_tag, message)) => self.deliver(message),
                    Err(err) => {
                        warn!("undecodable text frame: {}", err);
                        self.inner.events.emit(StackEvent::Error {
                            layer: "connection".to_string(),
                            reason: err.to_string(),
                            message: None,
                        });
                    }
                },
                Ok(None) => {
                    self.begin_failure(&ConnectionError::Closed);
                    return;
                }
                Err(err) => {
                    self.begin_failure(&err);
                    return;
                }
            }
        }
    }

    /// Decode every complete envelope sitting in `buffer`. A frame that
    /// fails to decode is skipped by its declared length so the stream can
    /// resynchronize on the next one.
    fn drain_frames(&self, buffer: &mut Vec<u8>) {
        loop {
            match self.inner.serializer.deserialize(buffer) {
                Ok((Some(message), rest)) => {
                    let rest = rest.to_vec();
                    *buffer = rest;
                    self.deliver(message);
                }
                Ok((None, _)) => return,
                Err(err) => {
                    warn!("dropping undecodable frame: {}", err);
                    self.inner.events.emit(StackEvent::Error {
                        layer: "connection".to_string(),
                        reason: err.to_string(),
                        message: None,
                    });
                    let skip = if buffer.len() >= HEADER_LEN {
                        let declared = u32::from_be_bytes([
                            buffer[3], buffer[4], buffer[5], buffer[6],
                        ]) as usize;
                        (HEADER_LEN + declared).min(buffer.len())
                    } else {
                        buffer.len()
                    };
                    buffer.drain(..skip);
                }
            }
        }
    }

    fn deliver(&self, message: Message) {
        if let Some(message) = self.inner.pending.complete(message) {
            if self.inner.inbound_tx.send(message).is_err() {
                debug!("inbound queue dropped; message discarded");
            }
        }
    }

    async fn heartbeat_loop(self, cancel: CancellationToken) {
        let interval = self.inner.config.ping_interval();
        loop {
            let deadline = *lock_or_panic(&self.inner.last_activity) + interval;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("heartbeat loop cancelled");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            // Sends in the meantime pushed the deadline forward.
            if *lock_or_panic(&self.inner.last_activity) + interval > Instant::now() {
                continue;
            }

            let tag = self.inner.tags.next_tag();
            debug!("idle past ping interval; sending keep-alive {}", tag);
            if self.send(&Message::keep_alive(tag)).await.is_err() {
                // The send already started the failure path.
                return;
            }
        }
    }

    /// First responder for a transport error. Only one failure at a time
    /// enters the reconnection path; the rest are dropped. A failure
    /// surfacing after an intentional `disconnect()` stays down: the read
    /// loop can observe a ready EOF in the same poll that cancels it.
    fn begin_failure(&self, error: &ConnectionError) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            debug!("transport failure after shutdown ignored: {}", error);
            return;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        warn!("transport failure: {}", error);
        tokio::spawn(self.clone().run_reconnect(error.to_string()));
    }

    async fn run_reconnect(self, error: String) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.current_cancel().cancel();
        self.join_tasks().await;
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            sink.close().await;
        }
        self.inner.pending.cancel_all();

        // A disconnect() while we back off cancels this token and aborts
        // the remaining attempts.
        let abort = CancellationToken::new();
        *lock_or_panic(&self.inner.cancel) = abort.clone();

        let max = self.inner.config.max_retries;
        let base_delay = self.inner.config.retry_delay();
        let mut last_error = error;
        let mut attempt = 0u32;

        while attempt < max {
            attempt += 1;
            self.inner.attempts.store(attempt, Ordering::SeqCst);

            tokio::select! {
                _ = abort.cancelled() => {
                    debug!("reconnection aborted");
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(base_delay * attempt) => {}
            }

            // A disconnect() that finished before the fresh token above was
            // installed cancelled the old one; re-check the flag so that
            // interleaving cannot redial either.
            if self.inner.shutdown.load(Ordering::SeqCst) {
                debug!("reconnection aborted by shutdown");
                self.inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            self.inner.events.emit(StackEvent::Disconnected {
                error: Some(last_error.clone()),
            });

            info!("reconnection attempt {}/{}", attempt, max);
            match self.establish(true, attempt).await {
                Ok(()) => {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(err) => {
                    warn!("reconnection attempt {} failed: {}", attempt, err);
                    last_error = err.to_string();
                }
            }
        }

        warn!("reconnection attempts exhausted; giving up");
        self.inner.events.emit(StackEvent::ConnectionFailed {
            error: last_error,
            permanent: true,
        });
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }

    fn current_cancel(&self) -> CancellationToken {
        lock_or_panic(&self.inner.cancel).clone()
    }

    async fn join_tasks(&self) {
        let handles: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn touch(&self) {
        *lock_or_panic(&self.inner.last_activity) = Instant::now();
    }
}

#[async_trait]
impl Layer for Connection {
    fn name(&self) -> &str {
        "connection"
    }

    /// Bottom of the pipeline: messages moving down end here, on the wire.
    async fn receive_from_upper(&self, message: Message) -> Result<Option<Message>, StackError> {
        self.send(&message).await?;
        Ok(None)
    }

    async fn on_stop(&self) {
        self.disconnect().await;
    }
}

fn lock_or_panic<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("connection state lock poisoned")
}
