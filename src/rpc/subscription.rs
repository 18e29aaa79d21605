//! Streaming commands: `stream`, `monitor`, `query` and their `stop`.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::rpc::client::{Response, RpcClient, RpcClientError};
use crate::rpc::codec;
use crate::rpc::dispatch::{Feed, Records, Route};
use crate::rpc::proto::{
    Command, LogRecord, MonitorRequest, QueryRecord, QueryRecordType, QueryRequest,
    RespondRequest, StopRequest, StreamEvent, StreamRequest,
};

/// Lifecycle of a subscription. Never moves backwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionState {
    /// Request sent, acknowledgement not yet seen.
    Created,
    Active,
    /// Retired by `stop`, a terminal record, or a connection failure.
    Stopped,
}

/// Receiving end of a streaming command.
///
/// Records arrive in wire order and queue here without bound, so a slow
/// consumer never stalls other traffic on the connection. A connection
/// failure or `close` is delivered as one final `Err` before the channel
/// ends. Dropping the handle detaches it; the agent keeps pushing until
/// [`Subscription::stop`] is called.
pub struct Subscription<T> {
    seq: u64,
    command: Command,
    records: Records,
    state: watch::Receiver<SubscriptionState>,
    client: RpcClient,
    _record: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("seq", &self.seq)
            .field("command", &self.command)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Sequence of the originating request; the value `stop` refers to.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Streaming command that opened this subscription.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Next record. `None` once the subscription is stopped and drained.
    pub async fn recv(&mut self) -> Option<Result<T, RpcClientError>> {
        let record = self.records.recv().await?;
        Some(record.and_then(codec::from_value))
    }

    /// Like [`Subscription::recv`], failing with `Timeout` after `limit`.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Option<Result<T, RpcClientError>> {
        match tokio::time::timeout(limit, self.recv()).await {
            Ok(record) => record,
            Err(_) => Some(Err(RpcClientError::Timeout(limit))),
        }
    }

    async fn recv_within(&mut self, limit: Option<Duration>) -> Option<Result<T, RpcClientError>> {
        match limit {
            Some(limit) => self.recv_timeout(limit).await,
            None => self.recv().await,
        }
    }

    /// Asks the agent to stop this subscription. The channel closes once the
    /// agent acknowledges.
    pub async fn stop(&self) -> Result<(), RpcClientError> {
        self.client.stop(self.seq).await
    }

    /// Runs `callback` for every record until the subscription ends. Returns
    /// the terminal error, if the subscription ended with one.
    pub async fn for_each<F>(mut self, mut callback: F) -> Result<(), RpcClientError>
    where
        F: FnMut(T),
    {
        while let Some(record) = self.recv().await {
            callback(record?);
        }
        Ok(())
    }
}

impl RpcClient {
    /// Subscribes to agent events. `event_types` uses the agent's filter
    /// syntax: `"*"`, `"member-join"`, `"user"`, `"user:deploy"`, `"query:ping"`.
    pub async fn stream<I, S>(
        &self,
        event_types: I,
    ) -> Result<(Response, Subscription<StreamEvent>), RpcClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let body = StreamRequest {
            event_types: join_event_types(event_types),
        };
        self.subscribe(Command::Stream, &body).await
    }

    /// Subscribes to the agent's log at `level` or above.
    pub async fn monitor(
        &self,
        level: &str,
    ) -> Result<(Response, Subscription<LogRecord>), RpcClientError> {
        let body = MonitorRequest {
            log_level: level.trim().to_uppercase(),
        };
        self.subscribe(Command::Monitor, &body).await
    }

    /// Sends `stop` for the subscription started at `seq` and returns
    /// without waiting. The subscription closes when the agent replies.
    pub async fn stop(&self, seq: u64) -> Result<(), RpcClientError> {
        let stop_seq = self
            .send_command(Command::Stop, Some(&StopRequest { stop: seq }), Route::Stop {
                target: seq,
            })
            .await?;
        debug!(event = "rpc_stop_sent", seq = stop_seq, target = seq);
        Ok(())
    }

    /// Runs a cluster query on the calling task, passing every ack and
    /// response record to `on_record` in arrival order. Returns the query's
    /// acknowledgement once the agent reports the query done.
    pub async fn query<F>(
        &self,
        params: &QueryRequest,
        mut on_record: F,
    ) -> Result<Response, RpcClientError>
    where
        F: FnMut(QueryRecord),
    {
        let (response, mut records) = self
            .subscribe::<QueryRecord, _>(Command::Query, params)
            .await?;
        loop {
            match records.recv_within(self.read_timeout()).await {
                Some(Ok(record)) if record.kind == QueryRecordType::Done => {
                    debug!(event = "rpc_query_complete", seq = records.seq());
                    return Ok(response);
                }
                Some(Ok(record)) => on_record(record),
                Some(Err(err)) => return Err(err),
                None => return Err(RpcClientError::ConnectionClosed),
            }
        }
    }

    /// Runs a query and gathers its ack and response records.
    pub async fn query_collect(
        &self,
        params: &QueryRequest,
    ) -> Result<Vec<QueryRecord>, RpcClientError> {
        let mut records = Vec::new();
        self.query(params, |record| records.push(record)).await?;
        Ok(records)
    }

    /// Answers the streamed query event `id`.
    pub async fn respond(
        &self,
        id: u32,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), RpcClientError> {
        let body = RespondRequest {
            id,
            payload: payload.into(),
        };
        self.request(Command::Respond, Some(&body)).await?;
        Ok(())
    }

    async fn subscribe<T, B>(
        &self,
        command: Command,
        body: &B,
    ) -> Result<(Response, Subscription<T>), RpcClientError>
    where
        B: Serialize + ?Sized,
    {
        let (feed, receiver) = Feed::channel(command, self.subscription_capacity());
        let seq = self
            .send_command(command, Some(body), Route::Feed(feed))
            .await?;
        let response = match self.await_reply(receiver.ack).await {
            Ok(response) => response,
            Err(err @ RpcClientError::Timeout(_)) => {
                // The caller never learns `seq`, so nobody else can stop it.
                warn!(event = "rpc_subscription_ack_timeout", seq, command = %command);
                if let Err(stop_err) = self.stop(seq).await {
                    debug!(event = "rpc_subscription_stop_failed", seq, error = %stop_err);
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        info!(event = "rpc_subscription_started", seq, command = %command);

        Ok((
            response,
            Subscription {
                seq,
                command,
                records: receiver.records,
                state: receiver.state,
                client: self.clone(),
                _record: PhantomData,
            },
        ))
    }
}

fn join_event_types<I, S>(event_types: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    event_types
        .into_iter()
        .map(|event_type| event_type.as_ref().trim().to_string())
        .filter(|event_type| !event_type.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}
