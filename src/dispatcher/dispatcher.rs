use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::connection::frame_reader::{FrameReader, ReadError, ReceivedFrame};
use crate::connection::Connection;
use crate::dispatcher::call_table::CallTable;
use crate::error::{CallTimings, TransportError, TransportErrorKind};
use crate::util::buffer_pool::BufferPool;
use crate::wire::request::{encode_request, ServiceRequest};
use crate::wire::response::{ResponseHeaders, StoreResponse};

/// initial size of the buffer a request's header and metadata are encoded into
const REQUEST_BUFFER_SIZE: usize = 1024;

/// Multiplexes calls over a single connection. Every call is registered in the call table under
///  a fresh transport request id before it is written, and a single receive loop per connection
///  matches responses to calls by that id.
///
/// Once the dispatcher stops accepting calls (because it was closed, or because the connection
///  failed), it never accepts calls again. Connection-level failures are broadcast to every
///  pending call, and [Dispatcher::stopped] lets the owner react to them.
pub struct Dispatcher {
    connection: Arc<Connection>,
    calls: Arc<Mutex<CallTable>>,
    buffer_pool: Arc<BufferPool>,
    send_timeout: Duration,
    request_timeout: Duration,
    /// set once the dispatcher stops, for whatever reason
    stopped: Arc<watch::Sender<bool>>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(connection: Arc<Connection>, buffer_pool: Arc<BufferPool>, send_timeout: Duration, request_timeout: Duration) -> Dispatcher {
        Dispatcher {
            connection,
            calls: Arc::new(Mutex::new(CallTable::new())),
            buffer_pool,
            send_timeout,
            request_timeout,
            stopped: Arc::new(watch::Sender::new(false)),
            receive_loop: Mutex::new(None),
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_accepting(&self) -> bool {
        self.lock_calls().is_accepting()
    }

    pub fn num_pending_calls(&self) -> usize {
        self.lock_calls().len()
    }

    pub fn is_healthy(&self) -> bool {
        self.is_accepting() && self.connection.is_healthy()
    }

    /// Completes once the dispatcher has stopped, either because it was closed or because the
    ///  connection failed
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;
    }

    /// Starts the receive loop. It runs until the connection fails or the dispatcher is closed.
    pub fn start_receive_loop(&self, reader: FrameReader) {
        let calls = self.calls.clone();
        let connection = self.connection.clone();
        let stopped = self.stopped.clone();

        let span = span!(Level::DEBUG, "receive_loop", server = %self.connection.server());
        let handle = tokio::spawn(receive_loop(reader, calls, connection, stopped).instrument(span));

        let previous = self.receive_loop.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            warn!("receive loop for {} was started twice", self.connection.server());
            previous.abort();
        }
    }

    pub async fn call(&self, request: &ServiceRequest, replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
        let server = self.connection.server();
        let started = Instant::now();

        let (request_id, response) = self.lock_calls().register(activity_id)
            .map_err(|e| e.with_server(server).with_activity_id(activity_id))?;
        let _guard = CallGuard { calls: &self.calls, request_id };

        let mut buf = self.buffer_pool.lease(REQUEST_BUFFER_SIZE);
        let body = encode_request(request, replica_path, activity_id, request_id, &mut buf)
            .map_err(|e| TransportError::new(TransportErrorKind::InvalidRequestHeader, e.to_string())
                .with_server(server)
                .with_activity_id(activity_id))?;

        trace!(request_id, ?activity_id, "sending {:?} {:?} to {}", request.operation_type, request.resource_type, server);

        let send_started = Instant::now();
        let write_result = timeout(self.send_timeout, self.connection.write_frame(&buf, body.as_deref())).await;
        drop(buf);

        let mut timings = CallTimings {
            wait: send_started - started,
            send: send_started.elapsed(),
            receive: Duration::ZERO,
        };

        let send_error = match write_result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(TransportError::new(TransportErrorKind::SendFailed, format!("writing request: {}", e))
                .with_payload_sent(false)),
            // a partial frame may have been written
            Err(_) => Some(TransportError::new(TransportErrorKind::SendTimeout, format!("writing request took longer than {:?}", self.send_timeout))
                .with_payload_sent(true)),
        };
        if let Some(e) = send_error {
            let e = e.with_server(server).with_activity_id(activity_id).with_timings(timings);
            debug!(request_id, "{}", e);
            self.fail_connection(TransportError::new(TransportErrorKind::ConnectionBroken, format!("connection torn down after a failed write: {}", e.detail)));
            return Err(e);
        }

        let receive_started = Instant::now();
        let result = timeout(self.request_timeout, response).await;
        timings.receive = receive_started.elapsed();

        match result {
            Ok(Ok(Ok(frame))) => {
                to_store_response(frame).map_err(|e| e.with_server(server).with_activity_id(activity_id).with_timings(timings))
            }
            Ok(Ok(Err(e))) => {
                Err(e.with_server(server).with_payload_sent(true).with_timings(timings))
            }
            Ok(Err(_)) => {
                Err(TransportError::new(TransportErrorKind::ConnectionBroken, "call was dropped without a response")
                    .with_server(server)
                    .with_activity_id(activity_id)
                    .with_payload_sent(true)
                    .with_timings(timings))
            }
            Err(_) => {
                debug!(request_id, ?activity_id, "no response from {} within {:?}", server, self.request_timeout);
                self.connection.record_transit_timeout();
                Err(TransportError::new(TransportErrorKind::ReceiveTimeout, format!("no response within {:?}", self.request_timeout))
                    .with_server(server)
                    .with_activity_id(activity_id)
                    .with_payload_sent(true)
                    .with_timings(timings))
            }
        }
    }

    /// Stops accepting calls if there are none in flight. Checking and closing happen under the
    ///  call table's lock, so a concurrent call is either registered before (and the dispatcher
    ///  stays open) or rejected after.
    pub fn try_close_if_idle(&self) -> bool {
        let mut calls = self.lock_calls();
        if !calls.is_accepting() || !calls.is_empty() {
            return false;
        }
        calls.close(TransportError::new(TransportErrorKind::ChannelClosed, "closed after being idle"));
        true
    }

    /// Fails all pending calls with `reason`, stops the receive loop, and waits for it to
    ///  terminate
    pub async fn close(&self, reason: TransportError) {
        let num_failed = self.lock_calls().close(reason.with_server(self.connection.server()));
        if num_failed > 0 {
            debug!("closing dispatcher for {} failed {} pending calls", self.connection.server(), num_failed);
        }
        self.stopped.send_replace(true);

        let handle = self.receive_loop.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // a receive loop that terminates regularly shuts the connection down itself
        let shut_down = match handle {
            Some(handle) => match handle.await {
                Ok(()) => true,
                Err(e) => {
                    if e.is_panic() {
                        error!("receive loop for {} panicked: {}", self.connection.server(), e);
                    }
                    false
                }
            },
            None => false,
        };
        if !shut_down {
            self.connection.shutdown().await;
        }
    }

    fn fail_connection(&self, reason: TransportError) {
        let num_failed = self.lock_calls().close(reason.with_server(self.connection.server()).with_payload_sent(true));
        debug!("connection to {} failed, {} pending calls failed", self.connection.server(), num_failed);
        self.stopped.send_replace(true);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.receive_loop.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

/// Removes a call from the table when the caller stops waiting for it, no matter how
struct CallGuard<'a> {
    calls: &'a Mutex<CallTable>,
    request_id: u32,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.calls.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.request_id);
    }
}

/// Fails all calls that are still pending when the receive loop ends, including by panic or abort
struct FailPendingOnExit {
    calls: Arc<Mutex<CallTable>>,
}

impl Drop for FailPendingOnExit {
    fn drop(&mut self) {
        self.calls.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close(TransportError::new(TransportErrorKind::ConnectionBroken, "receive loop terminated"));
    }
}

fn to_store_response(frame: ReceivedFrame) -> Result<StoreResponse, TransportError> {
    let headers = ResponseHeaders::decode(&frame.metadata)
        .map_err(|e| TransportError::new(TransportErrorKind::InternalServerError, format!("malformed response metadata: {}", e))
            .with_payload_sent(true))?;

    Ok(StoreResponse {
        status: frame.header.status,
        activity_id: frame.header.activity_id,
        headers,
        body: frame.body,
    })
}

/// Maps a failure of the receive side to the error broadcast to all pending calls
fn read_failure(e: ReadError) -> TransportError {
    let kind = match &e {
        ReadError::StreamClosed => TransportErrorKind::ReceiveStreamClosed,
        ReadError::Io(_) => TransportErrorKind::ReceiveFailed,
        ReadError::Protocol(wire) if wire.is_framing_error() => TransportErrorKind::InternalServerError,
        ReadError::Protocol(_) => TransportErrorKind::ConnectionBroken,
    };
    TransportError::new(kind, e.to_string())
}

async fn receive_loop(mut reader: FrameReader, calls: Arc<Mutex<CallTable>>, connection: Arc<Connection>, stopped: Arc<watch::Sender<bool>>) {
    debug!("starting receive loop");
    let _fail_pending = FailPendingOnExit { calls: calls.clone() };
    let mut stop_requested = stopped.subscribe();

    let failure = loop {
        let frame = select! {
            _ = stop_requested.wait_for(|s| *s) => break None,
            frame = reader.read_response() => frame,
        };

        match frame {
            Ok(frame) => {
                let request_id = frame.mandatory.transport_request_id;
                let found = calls.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .complete(request_id, Ok(frame));
                if !found {
                    debug!(request_id, "response for a call that is no longer pending, discarding it");
                }
            }
            Err(e) => break Some(read_failure(e)),
        }
    };

    match failure {
        None => debug!("receive loop shut down"),
        Some(reason) => {
            let reason = reason.with_server(connection.server()).with_payload_sent(true);
            warn!("receive loop failed: {}", reason);
            let num_failed = calls.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close(reason);
            debug!("failed {} pending calls", num_failed);
            stopped.send_replace(true);
        }
    }

    connection.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use crate::address::Endpoint;
    use crate::config::TransportConfig;
    use crate::connection::stats::ConnectionStats;
    use crate::dispatcher::negotiation::negotiate_context;
    use crate::test_util::frames::{encode_response, read_request};
    use crate::test_util::mock_server::{serve_connection, MockBehavior, MockServerStats};
    use crate::wire::context::ContextRequest;
    use crate::wire::resource::{OperationType, ResourceType};

    fn request() -> ServiceRequest {
        ServiceRequest::new(ResourceType::Document, OperationType::Read)
    }

    fn raw_dispatcher(stream: DuplexStream, request_timeout: Duration) -> (Arc<Dispatcher>, FrameReader) {
        let config = TransportConfig::default();
        let pool = BufferPool::with_defaults(4);
        let connection = Connection::from_stream(Endpoint::new("mock", 1), Box::new(stream), &config.connection, pool.clone(), Arc::new(ConnectionStats::new()));
        let reader = connection.take_reader().unwrap();
        let dispatcher = Dispatcher::new(Arc::new(connection), pool, config.connection.send_timeout, request_timeout);
        (Arc::new(dispatcher), reader)
    }

    /// a dispatcher connected to a mock server, with the context negotiated and the receive loop running
    async fn dispatcher_for(behavior: MockBehavior, request_timeout: Duration) -> (Arc<Dispatcher>, Arc<MockServerStats>) {
        let (client, server) = duplex(64 * 1024);
        let stats = Arc::new(MockServerStats::default());
        tokio::spawn(serve_connection(server, behavior, stats.clone()));

        let (dispatcher, mut reader) = raw_dispatcher(client, request_timeout);
        let context_request = ContextRequest { client_version: "v".to_string(), user_agent: "test".to_string() };
        negotiate_context(dispatcher.connection(), &mut reader, &context_request, Uuid::new_v4()).await.unwrap();
        dispatcher.start_receive_loop(reader);
        (dispatcher, stats)
    }

    #[tokio::test]
    async fn test_echo() {
        let (dispatcher, stats) = dispatcher_for(MockBehavior::Echo, Duration::from_secs(5)).await;
        let activity_id = Uuid::new_v4();

        let response = dispatcher.call(&request(), "/r/", activity_id).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.activity_id, activity_id);
        assert!(response.headers.is_empty());
        assert_eq!(response.body, None);
        assert_eq!(stats.num_requests(), 1);
        assert_eq!(dispatcher.num_pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_with_bodies() {
        let (dispatcher, _) = dispatcher_for(MockBehavior::Echo, Duration::from_secs(5)).await;

        let calls = (0..20)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let body = Bytes::from(format!("body {}", i));
                    let response = dispatcher.call(&request().with_body(body.clone()), "/r/", Uuid::new_v4()).await.unwrap();
                    assert_eq!(response.body, Some(body));
                })
            })
            .collect::<Vec<_>>();
        for call in calls {
            call.await.unwrap();
        }
        assert_eq!(dispatcher.num_pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_abrupt_close_fails_every_pending_call() {
        const K: usize = 5;
        let (dispatcher, _) = dispatcher_for(MockBehavior::CloseAfter(K), Duration::from_secs(30)).await;

        let calls = (0..K)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
            })
            .collect::<Vec<_>>();

        let mut num_failed = 0;
        for call in calls {
            let e = call.await.unwrap().unwrap_err();
            assert_eq!(e.kind, TransportErrorKind::ReceiveStreamClosed);
            assert!(e.payload_sent);
            num_failed += 1;
        }
        assert_eq!(num_failed, K);
        assert!(!dispatcher.is_accepting());
        timeout(Duration::from_secs(5), dispatcher.stopped()).await
            .expect("a failed connection stops the dispatcher");

        let late = dispatcher.call(&request(), "/r/", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(late.kind, TransportErrorKind::ChannelMultiplexerClosed);
    }

    #[tokio::test]
    async fn test_header_below_minimum_length_is_broadcast() {
        let (client, mut server) = duplex(64 * 1024);
        let (dispatcher, reader) = raw_dispatcher(client, Duration::from_secs(30));
        dispatcher.start_receive_loop(reader);

        let calls = (0..3)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
            })
            .collect::<Vec<_>>();

        for _ in 0..3 {
            read_request(&mut server).await.unwrap().unwrap();
        }
        let mut frame = encode_response(200, Uuid::nil(), 1, &[], None);
        frame[..4].copy_from_slice(&10u32.to_le_bytes());
        server.write_all(&frame).await.unwrap();

        for call in calls {
            let e = call.await.unwrap().unwrap_err();
            assert_eq!(e.kind, TransportErrorKind::InternalServerError);
        }
    }

    #[tokio::test]
    async fn test_malformed_header_from_mock_server() {
        let (dispatcher, _) = dispatcher_for(MockBehavior::MalformedHeader, Duration::from_secs(30)).await;
        let e = dispatcher.call(&request(), "/r/", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(e.kind, TransportErrorKind::InternalServerError);
        assert!(!dispatcher.is_accepting());
    }

    #[tokio::test]
    async fn test_missing_mandatory_token_breaks_connection() {
        let (client, mut server) = duplex(64 * 1024);
        let (dispatcher, reader) = raw_dispatcher(client, Duration::from_secs(30));
        dispatcher.start_receive_loop(reader);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
        };
        read_request(&mut server).await.unwrap().unwrap();
        server.write_all(&crate::test_util::frames::encode_frame(200, Uuid::nil(), &[], None)).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap_err().kind, TransportErrorKind::ConnectionBroken);
        dispatcher.stopped().await;

        // the receive loop shut the write side down on its way out
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), server.read_to_end(&mut rest)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_discarded() {
        let (client, mut server) = duplex(64 * 1024);
        let (dispatcher, reader) = raw_dispatcher(client, Duration::from_secs(30));
        dispatcher.start_receive_loop(reader);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
        };
        let parsed = read_request(&mut server).await.unwrap().unwrap();
        let request_id = parsed.transport_request_id().unwrap();

        server.write_all(&encode_response(200, Uuid::nil(), request_id + 1000, &[], None)).await.unwrap();
        server.write_all(&encode_response(201, Uuid::nil(), request_id, &[], None)).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap().status, 201);
        assert!(dispatcher.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout() {
        let (client, _server) = duplex(64 * 1024);
        let (dispatcher, reader) = raw_dispatcher(client, Duration::from_secs(2));
        dispatcher.start_receive_loop(reader);

        let e = dispatcher.call(&request(), "/r/", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(e.kind, TransportErrorKind::ReceiveTimeout);
        assert!(e.payload_sent);
        assert!(e.timings.receive >= Duration::from_secs(2));
        assert_eq!(dispatcher.num_pending_calls(), 0);
        assert!(dispatcher.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_is_removed() {
        let (client, _server) = duplex(64 * 1024);
        let (dispatcher, reader) = raw_dispatcher(client, Duration::from_secs(30));
        dispatcher.start_receive_loop(reader);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dispatcher.num_pending_calls(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(dispatcher.num_pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_header_is_not_sent() {
        let (dispatcher, stats) = dispatcher_for(MockBehavior::Echo, Duration::from_secs(5)).await;

        let e = dispatcher.call(&request().with_header("x-ms-consistency-level", "Sometimes"), "/r/", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(e.kind, TransportErrorKind::InvalidRequestHeader);
        assert!(!e.payload_sent);
        assert_eq!(stats.num_requests(), 0);
        assert!(dispatcher.is_accepting());
    }

    #[tokio::test]
    async fn test_try_close_if_idle() {
        let (client, _server) = duplex(64 * 1024);
        let (dispatcher, reader) = raw_dispatcher(client, Duration::from_secs(30));
        dispatcher.start_receive_loop(reader);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
        };
        while dispatcher.num_pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!dispatcher.try_close_if_idle());

        call.abort();
        let _ = call.await;
        assert!(dispatcher.try_close_if_idle());
        assert!(!dispatcher.try_close_if_idle());

        let e = dispatcher.call(&request(), "/r/", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(e.kind, TransportErrorKind::ChannelClosed);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_stops_loop() {
        let (dispatcher, _) = dispatcher_for(MockBehavior::Silent, Duration::from_secs(30)).await;

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call(&request(), "/r/", Uuid::new_v4()).await })
        };
        while dispatcher.num_pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        dispatcher.close(TransportError::new(TransportErrorKind::ChannelClosed, "test")).await;
        let e = call.await.unwrap().unwrap_err();
        assert_eq!(e.kind, TransportErrorKind::ChannelClosed);
        assert!(dispatcher.receive_loop.lock().unwrap().is_none());
        dispatcher.stopped().await;
    }
}
