//! The connection's reader task and its dispatch table.
//!
//! Exactly one task reads the socket. Writers register a [`Route`] for every
//! sequence before the frame goes out, and the reader delivers each reply
//! (and each pushed record) to the route keyed by its sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rmpv::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::rpc::client::{Response, RpcClientError, SessionState};
use crate::rpc::codec;
use crate::rpc::proto::{is_query_done, Command, ResponseHeader};
use crate::rpc::subscription::SubscriptionState;
use crate::rpc::transport::TransportReader;

/// Stopped subscriptions whose late frames are still drained quietly.
const RETIRED_ROUTES: usize = 32;

pub(crate) type ReplySender = oneshot::Sender<Result<Response, RpcClientError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Response, RpcClientError>>;
type Record = Result<Value, RpcClientError>;

/// Where the frames for one sequence go.
#[derive(Debug)]
pub(crate) enum Route {
    /// One reply, with a body when the command's reply shape has one.
    Reply { command: Command, reply: ReplySender },
    /// An acknowledged stream of records (`stream`, `monitor`, `query`).
    Feed(Feed),
    /// The reply to a `stop`, which retires `target` when it succeeds.
    Stop { target: u64 },
}

#[derive(Debug)]
pub(crate) struct Registration {
    pub seq: u64,
    pub route: Route,
}

/// Reader side of a subscription. Dropping it marks the subscription
/// `Stopped`, whichever way the reader lets go of it.
#[derive(Debug)]
pub(crate) struct Feed {
    kind: Command,
    ack: Option<ReplySender>,
    records: mpsc::UnboundedSender<Record>,
    queued: Arc<AtomicUsize>,
    high_water: usize,
    state: watch::Sender<SubscriptionState>,
    detached: bool,
}

/// Consumer side of a [`Feed`].
#[derive(Debug)]
pub(crate) struct FeedReceiver {
    pub ack: ReplyReceiver,
    pub records: Records,
    pub state: watch::Receiver<SubscriptionState>,
}

/// Records forwarded to one subscription, in wire order.
#[derive(Debug)]
pub(crate) struct Records {
    rx: mpsc::UnboundedReceiver<Record>,
    queued: Arc<AtomicUsize>,
}

impl Records {
    pub(crate) async fn recv(&mut self) -> Option<Record> {
        let record = self.rx.recv().await?;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        Some(record)
    }
}

impl Feed {
    /// New feed for `kind`. The reader warns once `high_water` records are
    /// waiting on the consumer.
    pub(crate) fn channel(kind: Command, high_water: usize) -> (Self, FeedReceiver) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);
        let queued = Arc::new(AtomicUsize::new(0));
        let feed = Self {
            kind,
            ack: Some(ack_tx),
            records: records_tx,
            queued: Arc::clone(&queued),
            high_water: high_water.max(1),
            state: state_tx,
            detached: false,
        };
        let receiver = FeedReceiver {
            ack: ack_rx,
            records: Records {
                rx: records_rx,
                queued,
            },
            state: state_rx,
        };
        (feed, receiver)
    }

    fn push(&self, record: Record) -> Option<usize> {
        let queued = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if self.records.send(record).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(queued)
    }

    /// Hands a record to the consumer without waiting on it.
    fn forward(&mut self, seq: u64, record: Record) {
        if self.detached {
            debug!(event = "rpc_record_discarded", seq, command = %self.kind);
            return;
        }
        match self.push(record) {
            Some(queued) if queued == self.high_water => {
                warn!(event = "rpc_subscription_backlog", seq, command = %self.kind, queued);
            }
            Some(_) => {}
            None => self.detach(seq),
        }
    }

    fn detach(&mut self, seq: u64) {
        if !self.detached {
            warn!(event = "rpc_subscription_detached", seq, command = %self.kind);
            self.detached = true;
        }
    }

    /// Delivers `err` as the last item the consumer will see.
    fn fail(mut self, seq: u64, err: RpcClientError) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(Err(err));
            return;
        }
        if !self.detached && self.push(Err(err)).is_none() {
            debug!(event = "rpc_subscription_final_error_dropped", seq);
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.state.send_replace(SubscriptionState::Stopped);
    }
}

#[derive(Debug, Default)]
struct DispatchTable {
    routes: HashMap<u64, Route>,
    retired: VecDeque<u64>,
}

impl DispatchTable {
    fn register(&mut self, registration: Registration) {
        if self
            .routes
            .insert(registration.seq, registration.route)
            .is_some()
        {
            warn!(event = "rpc_route_replaced", seq = registration.seq);
        }
    }

    /// Remembers a stopped subscription so frames already in flight for it
    /// are drained instead of failing the session.
    fn retire(&mut self, seq: u64) {
        if self.retired.len() == RETIRED_ROUTES {
            self.retired.pop_front();
        }
        self.retired.push_back(seq);
    }

    async fn dispatch(
        &mut self,
        message: Value,
        reader: &mut TransportReader,
    ) -> Result<(), RpcClientError> {
        let header: ResponseHeader = codec::from_value(message)?;
        let seq = header.seq;
        let Some(route) = self.routes.remove(&seq) else {
            if self.retired.contains(&seq) {
                read_body(reader, seq).await?;
                debug!(event = "rpc_retired_frame_drained", seq);
                return Ok(());
            }
            warn!(event = "rpc_uncorrelated_reply", seq);
            return Err(RpcClientError::Protocol(format!(
                "reply for unknown sequence {seq}"
            )));
        };

        match route {
            Route::Reply { command, reply } => {
                // The agent sends the body even alongside an error.
                let body = if command.reply_has_body() {
                    Some(read_body(reader, seq).await?)
                } else {
                    None
                };
                debug!(event = "rpc_reply_received", seq, command = %command, error = %header.error);
                let outcome = if header.is_error() {
                    Err(RpcClientError::Rpc(header.error))
                } else {
                    Ok(Response::new(header, body))
                };
                if reply.send(outcome).is_err() {
                    debug!(event = "rpc_reply_discarded", seq, command = %command);
                }
            }
            Route::Feed(feed) => {
                if let Some(feed) = feed_frame(header, feed, reader).await? {
                    self.routes.insert(seq, Route::Feed(feed));
                }
            }
            Route::Stop { target } => {
                if header.is_error() {
                    warn!(event = "rpc_stop_rejected", seq, target, error = %header.error);
                    return Ok(());
                }
                match self.routes.remove(&target) {
                    Some(Route::Feed(feed)) => {
                        info!(event = "rpc_subscription_stopped", seq = target, command = %feed.kind);
                        self.retire(target);
                    }
                    Some(other) => {
                        self.routes.insert(target, other);
                    }
                    None => debug!(event = "rpc_stop_target_gone", seq, target),
                }
            }
        }
        Ok(())
    }

    /// Fails pending replies first, then every live subscription.
    fn fail_all(&mut self, err: &RpcClientError) {
        let mut feeds = Vec::new();
        for (seq, route) in self.routes.drain() {
            match route {
                Route::Reply { reply, .. } => {
                    let _ = reply.send(Err(err.for_waiter()));
                }
                Route::Feed(feed) => feeds.push((seq, feed)),
                Route::Stop { .. } => {}
            }
        }
        feeds.sort_by_key(|(seq, _)| *seq);
        for (seq, feed) in feeds {
            feed.fail(seq, err.for_waiter());
        }
    }
}

/// Handles one frame on a feed. Returns the feed when it stays live.
async fn feed_frame(
    header: ResponseHeader,
    mut feed: Feed,
    reader: &mut TransportReader,
) -> Result<Option<Feed>, RpcClientError> {
    let seq = header.seq;

    if let Some(ack) = feed.ack.take() {
        if header.is_error() {
            debug!(event = "rpc_subscription_rejected", seq, command = %feed.kind, error = %header.error);
            let _ = ack.send(Err(RpcClientError::Rpc(header.error)));
            return Ok(None);
        }
        feed.state.send_replace(SubscriptionState::Active);
        if ack.send(Ok(Response::new(header, None))).is_err() {
            feed.detach(seq);
        }
        return Ok(Some(feed));
    }

    let body = read_body(reader, seq).await?;
    let done = feed.kind == Command::Query && is_query_done(&body);
    let record = if header.is_error() {
        warn!(event = "rpc_record_error", seq, command = %feed.kind, error = %header.error);
        Err(RpcClientError::Rpc(header.error))
    } else {
        Ok(body)
    };
    feed.forward(seq, record);

    if done {
        debug!(event = "rpc_query_done", seq);
        return Ok(None);
    }
    Ok(Some(feed))
}

async fn read_body(reader: &mut TransportReader, seq: u64) -> Result<Value, RpcClientError> {
    match reader.read_message().await? {
        Some(body) => Ok(body),
        None => {
            warn!(event = "rpc_body_missing", seq);
            Err(RpcClientError::ConnectionClosed)
        }
    }
}

async fn closed(session: &mut watch::Receiver<SessionState>) {
    let _ = session
        .wait_for(|state| *state == SessionState::Closed)
        .await;
}

/// Reader task body. Runs until the socket fails, the peer hangs up, the
/// session is closed, or every client handle is gone.
pub(crate) async fn run_reader(
    mut reader: TransportReader,
    mut registrations: mpsc::UnboundedReceiver<Registration>,
    session: Arc<watch::Sender<SessionState>>,
) {
    let mut table = DispatchTable::default();
    let mut shutdown = session.subscribe();

    let failure = loop {
        tokio::select! {
            biased;
            registration = registrations.recv() => match registration {
                Some(registration) => table.register(registration),
                None => break RpcClientError::ConnectionClosed,
            },
            _ = closed(&mut shutdown) => break RpcClientError::ConnectionClosed,
            message = reader.read_message() => {
                while let Ok(registration) = registrations.try_recv() {
                    table.register(registration);
                }
                match message {
                    Ok(Some(message)) => {
                        if let Err(err) = table.dispatch(message, &mut reader).await {
                            break err;
                        }
                    }
                    Ok(None) => break RpcClientError::ConnectionClosed,
                    Err(err) => break err,
                }
            }
        }
    };

    let previous = session.send_replace(SessionState::Closed);
    if previous != SessionState::Closed {
        warn!(event = "rpc_reader_stopped", error = %failure, pending = table.routes.len());
    } else {
        debug!(event = "rpc_reader_shutdown", pending = table.routes.len());
    }
    table.fail_all(&failure);
}
