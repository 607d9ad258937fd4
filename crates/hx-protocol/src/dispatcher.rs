//! Message dispatcher for one control stream
//!
//! A [`Dispatcher`] owns a duplex stream. After [`Dispatcher::run`] it drives
//! two tasks: a send loop draining a bounded queue into the stream, and a
//! receive loop decoding frames and invoking the handler registered for the
//! frame's tag. Handlers run inline on the receive loop, so messages on one
//! stream are processed in arrival order; wrap slow work with
//! [`async_handler`].
//!
//! Either direction failing, the peer closing, or [`DispatcherHandle::close`]
//! fires the done signal exactly once. From then on every send fails with
//! [`DispatcherError::Closed`]. [`DispatcherHandle::close_after_flush`]
//! refuses new sends at once but writes what is already queued before the
//! done signal fires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::MessageCodec;
use crate::error::DispatcherError;
use crate::message::{Message, MessageType};

/// Capacity of the outbound message queue.
///
/// `send` suspends once this many messages are queued and not yet written.
pub const SEND_QUEUE_CAPACITY: usize = 100;

/// Upper bound on writing out the queue after `close_after_flush`
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked for each received message of a registered type
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

/// Wrap an async function so every invocation runs in its own task.
///
/// The receive loop never waits on the returned future.
pub fn async_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| {
        tokio::spawn(f(msg));
    })
}

/// Configures handlers for a stream before it starts running
pub struct Dispatcher<S> {
    stream: S,
    handlers: HashMap<MessageType, Handler>,
    default_handler: Option<Handler>,
    send_tx: mpsc::Sender<Message>,
    send_rx: mpsc::Receiver<Message>,
    flush: CancellationToken,
    done: CancellationToken,
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a duplex stream
    pub fn new(stream: S) -> Self {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        Self {
            stream,
            handlers: HashMap::new(),
            default_handler: None,
            send_tx,
            send_rx,
            flush: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Register the handler for one message type, replacing any previous one
    pub fn register_handler(&mut self, message_type: MessageType, handler: Handler) {
        self.handlers.insert(message_type, handler);
    }

    /// Register the fallback for message types with no handler
    pub fn register_default_handler(&mut self, handler: Handler) {
        self.default_handler = Some(handler);
    }

    /// A handle usable before `run`; messages queue until the send loop starts
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.send_tx.clone(),
            flush: self.flush.clone(),
            done: self.done.clone(),
        }
    }

    /// Start the send and receive loops
    pub fn run(self) -> DispatcherHandle {
        let handle = self.handle();
        let Dispatcher {
            stream,
            handlers,
            default_handler,
            send_tx,
            send_rx,
            flush,
            done,
        } = self;
        // Only handles keep the queue open from here on
        drop(send_tx);

        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(send_loop(writer, send_rx, flush, done.clone()));
        tokio::spawn(read_loop(reader, handlers, default_handler, done));

        handle
    }
}

async fn send_loop<W>(
    writer: W,
    mut rx: mpsc::Receiver<Message>,
    flush: CancellationToken,
    done: CancellationToken,
) where
    W: AsyncWrite + Send,
{
    let mut framed = Box::pin(FramedWrite::new(writer, MessageCodec::new()));
    let mut flush_deadline: Option<Instant> = None;

    loop {
        let msg = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = flush.cancelled(), if flush_deadline.is_none() => {
                // recv now yields what is queued, then None
                rx.close();
                flush_deadline = Some(Instant::now() + FLUSH_TIMEOUT);
                continue;
            }
            msg = rx.recv() => msg,
        };

        let Some(msg) = msg else {
            break;
        };

        let msg_type = msg.message_type();
        let written = match flush_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, framed.send(msg)).await {
                Ok(written) => written,
                Err(_) => {
                    tracing::debug!("Dispatcher flush timed out writing {:?}", msg_type);
                    break;
                }
            },
            None => framed.send(msg).await,
        };
        if let Err(e) = written {
            tracing::debug!("Dispatcher write of {:?} failed: {}", msg_type, e);
            break;
        }
    }

    done.cancel();
    let _ = framed.close().await;
}

async fn read_loop<R>(
    reader: R,
    handlers: HashMap<MessageType, Handler>,
    default_handler: Option<Handler>,
    done: CancellationToken,
) where
    R: AsyncRead + Send,
{
    let mut framed = Box::pin(FramedRead::new(reader, MessageCodec::new()));

    loop {
        let next = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            next = framed.next() => next,
        };

        match next {
            Some(Ok(msg)) => {
                let msg_type = msg.message_type();
                if let Some(handler) = handlers.get(&msg_type) {
                    handler(msg);
                } else if let Some(handler) = &default_handler {
                    handler(msg);
                } else {
                    tracing::debug!("No handler for {:?}, dropping", msg_type);
                }
            }
            Some(Err(e)) => {
                tracing::debug!("Dispatcher read failed: {}", e);
                break;
            }
            None => {
                tracing::trace!("Dispatcher stream reached EOF");
                break;
            }
        }
    }

    done.cancel();
}

/// Cloneable sending side of a running dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Message>,
    flush: CancellationToken,
    done: CancellationToken,
}

impl DispatcherHandle {
    /// Queue a message, waiting for room if the queue is full
    pub async fn send(&self, msg: impl Into<Message>) -> Result<(), DispatcherError> {
        if self.is_closing() {
            return Err(DispatcherError::Closed);
        }
        let msg = msg.into();
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(DispatcherError::Closed),
            res = self.tx.send(msg) => res.map_err(|_| DispatcherError::Closed),
        }
    }

    /// Queue a message without waiting
    pub fn try_send(&self, msg: impl Into<Message>) -> Result<(), DispatcherError> {
        if self.is_closing() {
            return Err(DispatcherError::Closed);
        }
        self.tx.try_send(msg.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatcherError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatcherError::Closed,
        })
    }

    /// The completion signal, fired once when the dispatcher stops
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Wait for the dispatcher to stop
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Stop both loops; the underlying stream is dropped
    pub fn close(&self) {
        self.done.cancel();
    }

    /// Refuse further sends, write out everything already queued, then
    /// stop both loops.
    ///
    /// The queue is given at most [`FLUSH_TIMEOUT`] to drain.
    pub fn close_after_flush(&self) {
        self.flush.cancel();
    }

    fn is_closing(&self) -> bool {
        self.done.is_cancelled() || self.flush.is_cancelled()
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_message, write_message};
    use crate::message::{Ping, Pong};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatch_by_tag() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let mut dispatcher = Dispatcher::new(local);
        let tx = seen_tx.clone();
        dispatcher.register_handler(
            MessageType::Ping,
            Arc::new(move |msg| {
                let _ = tx.send(("ping", msg));
            }),
        );
        dispatcher.register_default_handler(Arc::new(move |msg| {
            let _ = seen_tx.send(("default", msg));
        }));
        let handle = dispatcher.run();

        write_message(&mut remote, &Ping::default().into()).await.unwrap();
        write_message(&mut remote, &Pong::default().into()).await.unwrap();

        let (which, msg) = seen_rx.recv().await.unwrap();
        assert_eq!(which, "ping");
        assert_eq!(msg.message_type(), MessageType::Ping);
        let (which, msg) = seen_rx.recv().await.unwrap();
        assert_eq!(which, "default");
        assert_eq!(msg.message_type(), MessageType::Pong);

        handle.send(Pong::default()).await.unwrap();
        let echoed = read_message(&mut remote).await.unwrap();
        assert_eq!(echoed, Message::Pong(Pong::default()));
    }

    #[tokio::test]
    async fn test_done_fires_on_eof_and_send_fails() {
        let (local, remote) = tokio::io::duplex(1024);
        let handle = Dispatcher::new(local).run();

        drop(remote);

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("done should fire after EOF");

        assert!(handle.is_closed());
        assert_eq!(
            handle.send(Ping::default()).await,
            Err(DispatcherError::Closed)
        );
        assert_eq!(handle.try_send(Ping::default()), Err(DispatcherError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(1024);
        let handle = Dispatcher::new(local).run();

        handle.close();
        handle.close();
        handle.closed().await;
        assert_eq!(
            handle.send(Ping::default()).await,
            Err(DispatcherError::Closed)
        );
    }

    #[tokio::test]
    async fn test_close_after_flush_writes_queued_messages() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let handle = Dispatcher::new(local).run();

        for i in 0..3 {
            handle
                .send(Pong {
                    error: format!("e{}", i),
                })
                .await
                .unwrap();
        }
        handle.close_after_flush();
        assert_eq!(
            handle.send(Pong::default()).await,
            Err(DispatcherError::Closed)
        );
        assert_eq!(handle.try_send(Pong::default()), Err(DispatcherError::Closed));

        for i in 0..3 {
            match read_message(&mut remote).await.unwrap() {
                Message::Pong(pong) => assert_eq!(pong.error, format!("e{}", i)),
                other => panic!("expected Pong, got {:?}", other),
            }
        }
        assert!(read_message(&mut remote).await.unwrap_err().is_eof());

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("done should fire once the queue is flushed");
    }

    #[tokio::test]
    async fn test_try_send_full_at_capacity() {
        let (local, _remote) = tokio::io::duplex(1024);
        let dispatcher = Dispatcher::new(local);
        let handle = dispatcher.handle();

        for _ in 0..SEND_QUEUE_CAPACITY {
            handle.try_send(Ping::default()).unwrap();
        }
        assert_eq!(handle.try_send(Ping::default()), Err(DispatcherError::Full));
    }

    #[tokio::test]
    async fn test_send_waits_for_room() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let dispatcher = Dispatcher::new(local);
        let handle = dispatcher.handle();

        for _ in 0..SEND_QUEUE_CAPACITY {
            handle.try_send(Ping::default()).unwrap();
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(50), handle.send(Pong::default()))
                .await
                .is_err(),
            "send should suspend while the queue is full"
        );

        let _running = dispatcher.run();
        tokio::time::timeout(Duration::from_secs(1), handle.send(Pong::default()))
            .await
            .expect("send should complete once the writer drains the queue")
            .unwrap();

        for _ in 0..SEND_QUEUE_CAPACITY {
            assert_eq!(
                read_message(&mut remote).await.unwrap(),
                Message::Ping(Ping::default())
            );
        }
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Pong(Pong::default())
        );
    }

    #[tokio::test]
    async fn test_protocol_error_closes() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let handle = Dispatcher::new(local).run();

        use tokio::io::AsyncWriteExt;
        remote.write_all(&[0xEE, 0, 0, 0, 0]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("done should fire on unknown tag");
    }

    #[tokio::test]
    async fn test_async_handler_does_not_block_reads() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let count = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);

        let mut dispatcher = Dispatcher::new(local);
        let c = count.clone();
        dispatcher.register_handler(
            MessageType::Ping,
            async_handler(move |_msg| {
                let c = c.clone();
                let mut gate = gate_rx.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    let _ = gate.wait_for(|open| *open).await;
                }
            }),
        );
        let _handle = dispatcher.run();

        for _ in 0..3 {
            write_message(&mut remote, &Ping::default().into()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("all handlers should start while earlier ones are blocked");

        let _ = gate_tx.send(true);
    }
}
