//! Gateway client
//!
//! Request/response client for the bus gateway: round-robin bootstrap
//! servers, exponential reconnect backoff, per-request deadlines. One
//! in-flight request per connection keeps the protocol trivially
//! correlated; the pipeline components are single-threaded loops, so
//! pipelining buys nothing here.

use crate::message::BusRecord;
use crate::traits::{BusConsumer, BusProducer};
use crate::wire::{read_frame, write_frame, Request, Response};
use async_trait::async_trait;
use duplex_core::{ReplicationError, Result};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_INITIAL_MS: u64 = 100;
const RECONNECT_BACKOFF_MAX_MS: u64 = 10_000;
/// Slack added on top of a fetch's long-poll wait before the read times out.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Framed request/response client to the bus gateway.
pub struct GatewayClient {
    servers: Vec<String>,
    conn: Mutex<Option<TcpStream>>,
    next_server: AtomicUsize,
    consecutive_failures: AtomicU32,
}

impl GatewayClient {
    /// Create a client over the given gateway addresses.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            conn: Mutex::new(None),
            next_server: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Issue one request and await its response within `deadline`.
    pub async fn call(&self, request: &Request, deadline: Duration) -> Result<Response> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(ReplicationError::bus("gateway connection unavailable"));
        };

        let body = serde_json::to_vec(request)?;
        let exchange = async {
            write_frame(stream, &body).await?;
            read_frame(stream).await
        };

        let frame = match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                // The connection state is unknown; drop it and surface the
                // failure so the caller rolls back / retries.
                *guard = None;
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                return Err(ReplicationError::timeout(format!(
                    "gateway response not received within {deadline:?}"
                )));
            }
        };

        self.consecutive_failures.store(0, Ordering::Relaxed);
        match serde_json::from_slice::<Response>(&frame)? {
            Response::Error { message } => Err(ReplicationError::bus(message)),
            response => Ok(response),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures > 0 {
            let backoff = RECONNECT_BACKOFF_INITIAL_MS
                .saturating_mul(1u64 << failures.min(10))
                .min(RECONNECT_BACKOFF_MAX_MS);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        for _ in 0..self.servers.len() {
            let idx = self.next_server.fetch_add(1, Ordering::Relaxed) % self.servers.len();
            let addr = &self.servers[idx];
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(server = %addr, "connected to bus gateway");
                    stream.set_nodelay(true).ok();
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    warn!(server = %addr, error = %e, "bus gateway connection failed");
                }
                Err(_) => {
                    warn!(server = %addr, "bus gateway connection timed out");
                }
            }
        }

        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        Err(ReplicationError::bus(format!(
            "no bus gateway reachable among {:?}",
            self.servers
        )))
    }
}

/// Producer half of the gateway client.
pub struct GatewayProducer {
    client: GatewayClient,
    produce_timeout: Duration,
}

impl GatewayProducer {
    pub fn new(servers: Vec<String>, produce_timeout: Duration) -> Self {
        Self {
            client: GatewayClient::new(servers),
            produce_timeout,
        }
    }
}

#[async_trait]
impl BusProducer for GatewayProducer {
    async fn produce(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let request = Request::Produce {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
        };
        match self.client.call(&request, self.produce_timeout).await? {
            Response::Produced { partition, offset } => {
                debug!(topic, key, partition, offset, "record accepted by bus");
                Ok(())
            }
            other => Err(ReplicationError::bus(format!(
                "unexpected produce response: {other:?}"
            ))),
        }
    }
}

/// Consumer half of the gateway client.
pub struct GatewayConsumer {
    client: GatewayClient,
    group: String,
    topics: Vec<String>,
}

impl GatewayConsumer {
    pub fn new(servers: Vec<String>, group: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            client: GatewayClient::new(servers),
            group: group.into(),
            topics,
        }
    }
}

#[async_trait]
impl BusConsumer for GatewayConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<BusRecord>> {
        let request = Request::Fetch {
            group: self.group.clone(),
            topics: self.topics.clone(),
            max_wait_ms: timeout.as_millis() as u64,
        };
        match self.client.call(&request, timeout + RESPONSE_GRACE).await? {
            Response::Record { record } => Ok(Some(record)),
            Response::Empty => Ok(None),
            other => Err(ReplicationError::bus(format!(
                "unexpected fetch response: {other:?}"
            ))),
        }
    }

    async fn commit(&self, record: &BusRecord) -> Result<()> {
        let request = Request::Commit {
            group: self.group.clone(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        };
        match self.client.call(&request, RESPONSE_GRACE).await? {
            Response::Committed => Ok(()),
            other => Err(ReplicationError::bus(format!(
                "unexpected commit response: {other:?}"
            ))),
        }
    }
}
