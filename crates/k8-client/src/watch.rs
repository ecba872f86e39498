//!
//! # Resumable watch
//!
//! A watch is a long lived GET whose body is one JSON event per line. The
//! stream follows the resource version of every event it yields so a dropped
//! connection resumes where it left off instead of replaying everything.
//!
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::Stream;
use futures_util::StreamExt;
use futures_util::stream;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::ApiRequest;
use crate::ClientError;
use crate::ConnectionManager;
use crate::K8Status;
use crate::K8Watch;
use crate::ListOptions;
use crate::Result;
use crate::manager::StreamResponse;

pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const UNBOUNDED_RETRIES: i64 = -1;

/// resource version to restart from once the server forgot ours
pub const GONE_CURSOR: &str = "0";

const MAX_LINE_LEN: usize = 16 * 1024 * 1024;
// time past the server side timeout before we give up on the connection ourselves
const TIMEOUT_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// starting point, `None` lets the server pick
    pub resource_version: Option<String>,
    /// server closes each connection after this long, a normal reconnect follows
    pub timeout_seconds: Option<u32>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    /// consecutive failures tolerated, negative for no limit
    pub max_retries: i64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            resource_version: None,
            timeout_seconds: None,
            label_selector: None,
            field_selector: None,
            backoff_floor: DEFAULT_BACKOFF_FLOOR,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            max_retries: UNBOUNDED_RETRIES,
        }
    }
}

impl WatchOptions {
    pub fn since(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: Some(resource_version.into()),
            ..Default::default()
        }
    }
}

/// Reconnect bookkeeping for one watch
#[derive(Debug, Clone)]
pub struct RetryState {
    retries: u32,
    backoff: Duration,
    floor: Duration,
    cap: Duration,
    max_retries: i64,
}

impl RetryState {
    pub fn new(floor: Duration, cap: Duration, max_retries: i64) -> Self {
        Self {
            retries: 0,
            backoff: floor,
            floor,
            cap,
            max_retries,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// count a failure and return the wait before reconnecting, `None` once the
    /// budget is spent
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.retries = self.retries.saturating_add(1);
        if self.max_retries >= 0 && i64::from(self.retries) > self.max_retries {
            return None;
        }
        let wait = self.backoff;
        self.backoff = self.backoff.saturating_mul(2).min(self.cap);
        Some(wait)
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.backoff = self.floor;
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
}

enum Decoded<T> {
    Event(K8Watch<T>),
    Skip,
    Gone,
    End(K8Status),
}

/// Splits a streamed body into lines
struct LineReader {
    response: StreamResponse,
    buffer: BytesMut,
    received: bool,
}

impl LineReader {
    fn new(response: StreamResponse) -> Self {
        Self {
            response,
            buffer: BytesMut::new(),
            received: false,
        }
    }

    fn is_blank(line: &[u8]) -> bool {
        line.iter().all(u8::is_ascii_whitespace)
    }

    async fn next_line(&mut self, path: &str) -> Result<Option<BytesMut>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if Self::is_blank(&line) {
                    continue;
                }
                self.received = true;
                return Ok(Some(line));
            }

            if self.buffer.len() > MAX_LINE_LEN {
                return Err(ClientError::MalformedStream {
                    path: path.to_owned(),
                    msg: format!("event larger than {MAX_LINE_LEN} bytes"),
                });
            }

            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if Self::is_blank(&self.buffer) => return Ok(None),
                None => {
                    self.received = true;
                    return Ok(Some(std::mem::take(&mut self.buffer)));
                }
            }
        }
    }
}

enum Phase {
    Connecting,
    Streaming(LineReader),
    Terminated,
}

struct WatchDriver<T> {
    manager: Arc<ConnectionManager>,
    path: String,
    options: WatchOptions,
    cursor: Option<String>,
    retry: RetryState,
    phase: Phase,
    _object: PhantomData<fn() -> T>,
}

impl<T> WatchDriver<T>
where
    T: DeserializeOwned,
{
    fn new(manager: Arc<ConnectionManager>, path: String, options: WatchOptions) -> Self {
        Self {
            cursor: options.resource_version.clone(),
            retry: RetryState::new(options.backoff_floor, options.backoff_cap, options.max_retries),
            manager,
            path,
            options,
            phase: Phase::Connecting,
            _object: PhantomData,
        }
    }

    fn request(&self) -> ApiRequest {
        let list = ListOptions {
            label_selector: self.options.label_selector.clone(),
            field_selector: self.options.field_selector.clone(),
            resource_version: self.cursor.clone(),
            timeout_seconds: self.options.timeout_seconds,
            watch: Some(true),
            ..Default::default()
        };
        let request = ApiRequest::get(self.path.as_str())
            .query(list.query_pairs())
            .unchecked();
        match self.options.timeout_seconds {
            Some(secs) => request.timeout(Duration::from_secs(u64::from(secs)) + TIMEOUT_SLACK),
            None => request.without_timeout(),
        }
    }

    async fn connect(&self) -> Result<StreamResponse> {
        debug!(path = %self.path, cursor = ?self.cursor, "connecting watch");
        let response = self.manager.stream(self.request()).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(response.into_status_error().await)
    }

    fn reset_cursor(&mut self) {
        info!(path = %self.path, cursor = ?self.cursor, "resource version expired, restarting watch");
        self.cursor = Some(GONE_CURSOR.to_owned());
        self.phase = Phase::Connecting;
    }

    /// decide what a failure means for the watch; returns the error to hand
    /// the caller when the watch cannot continue
    async fn on_failure(&mut self, err: ClientError) -> Option<ClientError> {
        // a second 410 from the fresh cursor is an ordinary failure
        if err.is_gone() && self.cursor.as_deref() != Some(GONE_CURSOR) {
            self.reset_cursor();
            return None;
        }

        if err.is_auth() {
            error!(path = %self.path, %err, "watch not authorized, stopping");
            self.phase = Phase::Terminated;
            return Some(err);
        }

        match self.retry.record_failure() {
            Some(wait) => {
                warn!(path = %self.path, retries = self.retry.retries(), ?wait, %err, "watch failed, reconnecting");
                sleep(wait).await;
                self.phase = Phase::Connecting;
                None
            }
            None => {
                error!(path = %self.path, retries = self.retry.retries(), %err, "watch retries exhausted");
                self.phase = Phase::Terminated;
                Some(ClientError::RetriesExhausted {
                    path: self.path.clone(),
                    retries: self.retry.retries(),
                    last: Box::new(err),
                })
            }
        }
    }

    fn decode(&mut self, line: &[u8]) -> Result<Decoded<T>> {
        trace!(line = %String::from_utf8_lossy(line), "watch line");
        let malformed = |msg: String| ClientError::MalformedStream {
            path: self.path.clone(),
            msg,
        };

        let raw: RawEvent = serde_json::from_slice(line).map_err(|err| malformed(err.to_string()))?;
        let is_status = raw.object.get("kind").and_then(Value::as_str) == Some("Status");
        if raw.event_type == "ERROR" || is_status {
            let status: K8Status = serde_json::from_value(raw.object).unwrap_or_default();
            return Ok(if status.is_gone() {
                Decoded::Gone
            } else {
                Decoded::End(status)
            });
        }

        let version = raw
            .object
            .get("metadata")
            .and_then(|meta| meta.get("resourceVersion"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let wrap: fn(T) -> K8Watch<T> = match raw.event_type.as_str() {
            "ADDED" => K8Watch::Added,
            "MODIFIED" => K8Watch::Modified,
            "DELETED" => K8Watch::Deleted,
            "BOOKMARK" => {
                if version.is_some() {
                    self.cursor = version;
                }
                return Ok(Decoded::Skip);
            }
            other => {
                warn!(path = %self.path, event_type = other, "ignoring unknown watch event");
                return Ok(Decoded::Skip);
            }
        };

        let object: T =
            serde_json::from_value(raw.object).map_err(|err| malformed(err.to_string()))?;
        if version.is_some() {
            self.cursor = version;
        }
        Ok(Decoded::Event(wrap(object)))
    }

    async fn next(&mut self) -> Option<Result<K8Watch<T>>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Terminated) {
                Phase::Terminated => return None,
                Phase::Connecting => match self.connect().await {
                    Ok(response) => self.phase = Phase::Streaming(LineReader::new(response)),
                    Err(err) => {
                        if let Some(err) = self.on_failure(err).await {
                            return Some(Err(err));
                        }
                    }
                },
                Phase::Streaming(mut reader) => match reader.next_line(&self.path).await {
                    Ok(Some(line)) => match self.decode(&line) {
                        // the budget only refills once the connection delivers something usable
                        Ok(Decoded::Event(event)) => {
                            self.retry.reset();
                            self.phase = Phase::Streaming(reader);
                            return Some(Ok(event));
                        }
                        Ok(Decoded::Skip) => {
                            self.retry.reset();
                            self.phase = Phase::Streaming(reader);
                        }
                        Ok(Decoded::Gone) => self.reset_cursor(),
                        Ok(Decoded::End(status)) => {
                            info!(path = %self.path, code = ?status.code, message = ?status.message, "watch ended by server");
                            return None;
                        }
                        Err(err) => {
                            drop(reader);
                            if let Some(err) = self.on_failure(err).await {
                                return Some(Err(err));
                            }
                        }
                    },
                    Ok(None) => {
                        let idle = !reader.received;
                        drop(reader);
                        debug!(path = %self.path, cursor = ?self.cursor, "watch closed by server, resuming");
                        if idle {
                            sleep(self.options.backoff_floor).await;
                        }
                        self.phase = Phase::Connecting;
                    }
                    Err(err) => {
                        drop(reader);
                        if let Some(err) = self.on_failure(err).await {
                            return Some(Err(err));
                        }
                    }
                },
            }
        }
    }
}

/// Stream of changes from a watch.
///
/// Only terminal errors are yielded; the stream ends right after one.
/// Dropping it closes the connection.
pub struct WatchStream<T> {
    inner: BoxStream<'static, Result<K8Watch<T>>>,
}

impl<T> WatchStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(manager: Arc<ConnectionManager>, path: impl Into<String>, options: WatchOptions) -> Self {
        let driver = WatchDriver::<T>::new(manager, path.into(), options);
        let inner = stream::unfold(driver, |mut driver| async move {
            driver.next().await.map(|item| (item, driver))
        })
        .boxed();
        Self { inner }
    }

    /// hand every event to `callback` until it breaks or the watch ends
    pub async fn for_each_event<F>(mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(K8Watch<T>) -> ControlFlow<()>,
    {
        while let Some(event) = self.inner.next().await {
            if callback(event?).is_break() {
                debug!("watch stopped by caller");
                break;
            }
        }
        Ok(())
    }
}

impl<T> Stream for WatchStream<T> {
    type Item = Result<K8Watch<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
