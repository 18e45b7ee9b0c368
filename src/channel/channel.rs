use std::mem;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, span, warn, Instrument, Level};
use uuid::Uuid;
use crate::address::Endpoint;
use crate::channel::factory::ChannelResources;
use crate::channel::idle_timer::run_idle_timer;
use crate::channel::TransportChannel;
use crate::dispatcher::negotiation::negotiate_context;
use crate::dispatcher::Dispatcher;
use crate::error::{CallTimings, TransportError, TransportErrorKind};
use crate::wire::context::{ContextRequest, ContextResponse};
use crate::wire::request::ServiceRequest;
use crate::wire::response::StoreResponse;

/// A channel's position in its lifecycle. Transitions only go forward, and `Closed` is terminal:
///  a closed channel is replaced, never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    WaitingToOpen,
    Opening,
    Open,
    Closed,
}

#[derive(Clone)]
enum Lifecycle {
    New,
    WaitingToOpen,
    Opening,
    Open(Arc<Dispatcher>),
    /// with the reason calls are rejected, if the channel did not close regularly
    Closed(Option<TransportError>),
}

impl Lifecycle {
    fn state(&self) -> ChannelState {
        match self {
            Lifecycle::New => ChannelState::New,
            Lifecycle::WaitingToOpen => ChannelState::WaitingToOpen,
            Lifecycle::Opening => ChannelState::Opening,
            Lifecycle::Open(_) => ChannelState::Open,
            Lifecycle::Closed(_) => ChannelState::Closed,
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, Lifecycle::Open(_) | Lifecycle::Closed(_))
    }

    fn is_closed(&self) -> bool {
        matches!(self, Lifecycle::Closed(_))
    }
}

/// A single connection to a server, with its dispatcher, wrapped in an explicit lifecycle.
///
/// The channel opens lazily: the first call (or an explicit `open`) starts a background task
///  that connects, negotiates TLS and the transport context, and starts the receive loop. All
///  calls arriving in the meantime wait for that same task, which is bounded by the open
///  timeout as a whole.
///
/// An open channel closes itself when its connection fails, which releases the connection.
pub struct Channel {
    this: Weak<Channel>,
    endpoint: Endpoint,
    resources: ChannelResources,
    lifecycle: watch::Sender<Lifecycle>,
    open_task: Mutex<Option<JoinHandle<()>>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    connection_watch: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(endpoint: Endpoint, resources: ChannelResources) -> Arc<Channel> {
        Arc::new_cyclic(|this| Channel {
            this: this.clone(),
            endpoint,
            resources,
            lifecycle: watch::Sender::new(Lifecycle::New),
            open_task: Mutex::new(None),
            idle_timer: Mutex::new(None),
            connection_watch: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle.borrow().state()
    }

    /// Applies a transition if `f` returns a successor for the current state, returning the
    ///  previous state
    fn transition(&self, f: impl FnOnce(&Lifecycle) -> Option<Lifecycle>) -> Option<Lifecycle> {
        let mut previous = None;
        self.lifecycle.send_if_modified(|current| {
            match f(current) {
                Some(next) => {
                    debug!("channel to {}: {:?} -> {:?}", self.endpoint, current.state(), next.state());
                    previous = Some(mem::replace(current, next));
                    true
                }
                None => false,
            }
        });
        previous
    }

    /// Starts opening the channel in the background. Only the first call has an effect.
    pub fn initialize(&self) {
        let started = self.transition(|s| matches!(s, Lifecycle::New).then_some(Lifecycle::WaitingToOpen)).is_some();
        if !started {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let span = span!(Level::DEBUG, "open_channel", server = %self.endpoint);
        let handle = tokio::spawn(this.run_open().instrument(span));
        *self.open_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn run_open(self: Arc<Self>) {
        let _settle = CloseIfUnsettled(&self);
        if self.transition(|s| matches!(s, Lifecycle::WaitingToOpen).then_some(Lifecycle::Opening)).is_none() {
            return;
        }

        let open_timeout = self.resources.config.channel.open_timeout;
        let deadline = Instant::now() + open_timeout;
        let opened = match timeout_at(deadline, self.connect_and_negotiate(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(
                TransportErrorKind::ChannelOpenTimeout,
                format!("channel did not open within {:?}", open_timeout),
            )),
        };

        let (dispatcher, context) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!("opening channel to {} failed: {}", self.endpoint, e);
                self.transition(|s| (!s.is_closed()).then(|| Lifecycle::Closed(Some(e.clone()))));
                return;
            }
        };

        let opened = self.transition(|s| matches!(s, Lifecycle::Opening).then(|| Lifecycle::Open(dispatcher.clone()))).is_some();
        if !opened {
            debug!("channel to {} was closed while opening", self.endpoint);
            dispatcher.close(TransportError::new(TransportErrorKind::ChannelClosed, "channel closed while opening")).await;
            return;
        }

        let span = span!(Level::DEBUG, "connection_watch", server = %self.endpoint);
        let handle = tokio::spawn(watch_connection(self.this.clone(), dispatcher.clone()).instrument(span));
        *self.connection_watch.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if let Some(idle_timeout) = effective_idle_timeout(self.resources.config.channel.idle_timeout, &context) {
            let span = span!(Level::DEBUG, "idle_timer", server = %self.endpoint);
            let handle = tokio::spawn(run_idle_timer(self.this.clone(), dispatcher, idle_timeout).instrument(span));
            *self.idle_timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }

    /// Opens and negotiates a connection. Negotiation that is still going on at `deadline` fails
    ///  as a negotiation timeout.
    async fn connect_and_negotiate(&self, deadline: Instant) -> Result<(Arc<Dispatcher>, ContextResponse), TransportError> {
        let config = &self.resources.config;

        let connection = Arc::new(self.resources.connector.connect(&self.endpoint).await?);
        let Some(mut reader) = connection.take_reader() else {
            return Err(TransportError::new(TransportErrorKind::Unknown, "reading side of a new connection is missing"));
        };

        let request = ContextRequest {
            client_version: config.channel.client_version.clone(),
            user_agent: config.channel.user_agent.clone(),
        };
        let context = match timeout_at(deadline, negotiate_context(&connection, &mut reader, &request, Uuid::new_v4())).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::new(
                TransportErrorKind::TransportNegotiationTimeout,
                format!("no context response within {:?}", config.channel.open_timeout),
            )),
        };

        let dispatcher = Arc::new(Dispatcher::new(connection, self.resources.buffer_pool.clone(), config.connection.send_timeout, config.channel.request_timeout));
        dispatcher.start_receive_loop(reader);
        Ok((dispatcher, context))
    }

    /// Waits until the channel is open or closed, opening it if necessary. The open task always
    ///  settles the channel within the open timeout.
    async fn wait_until_open(&self) -> Result<Arc<Dispatcher>, TransportError> {
        self.initialize();

        let mut lifecycle = self.lifecycle.subscribe();
        let settled = match lifecycle.wait_for(Lifecycle::is_settled).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => Lifecycle::Closed(None),
        };

        match settled {
            Lifecycle::Open(dispatcher) => Ok(dispatcher),
            Lifecycle::Closed(Some(open_failure)) => Err(open_failure.with_server(&self.endpoint)),
            _ => Err(TransportError::new(TransportErrorKind::ChannelClosed, "channel is closed").with_server(&self.endpoint)),
        }
    }

    pub async fn call(&self, request: &ServiceRequest, replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
        let started = Instant::now();
        let dispatcher = self.wait_until_open().await
            .map_err(|e| e
                .with_activity_id(activity_id)
                .with_timings(CallTimings { wait: started.elapsed(), ..CallTimings::default() }))?;
        let open_wait = started.elapsed();

        dispatcher.call(request, replica_path, activity_id).await
            .map_err(|mut e| {
                e.timings.wait += open_wait;
                e
            })
    }

    pub async fn open(&self) -> Result<(), TransportError> {
        self.wait_until_open().await.map(|_| ())
    }

    pub fn is_healthy(&self) -> bool {
        match &*self.lifecycle.borrow() {
            Lifecycle::New | Lifecycle::WaitingToOpen | Lifecycle::Opening => true,
            Lifecycle::Open(dispatcher) => dispatcher.is_healthy(),
            Lifecycle::Closed(_) => false,
        }
    }

    pub async fn close(&self) {
        let Some(previous) = self.transition(|s| (!s.is_closed()).then_some(Lifecycle::Closed(None))) else {
            return;
        };

        for task in [&self.open_task, &self.idle_timer] {
            if let Some(handle) = task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }

        if let Lifecycle::Open(dispatcher) = previous {
            dispatcher.close(TransportError::new(TransportErrorKind::ChannelClosed, "channel closed")).await;
        }
    }

    /// Closes the channel on behalf of its idle timer, after the dispatcher stopped accepting
    ///  calls. This must not abort the idle timer, which is the calling task.
    pub(super) async fn close_idle(&self, dispatcher: &Arc<Dispatcher>) {
        let closed = self.transition(|s| matches!(s, Lifecycle::Open(d) if Arc::ptr_eq(d, dispatcher)).then_some(Lifecycle::Closed(None)));
        if closed.is_some() {
            debug!("closing idle channel to {}", self.endpoint);
        }
        dispatcher.close(TransportError::new(TransportErrorKind::ChannelClosed, "closed after being idle")).await;
    }

    /// Closes the channel after its dispatcher stopped on its own because the connection failed.
    ///  Later calls are rejected with [TransportErrorKind::ChannelMultiplexerClosed].
    async fn close_broken(&self, dispatcher: &Arc<Dispatcher>) {
        let reason = TransportError::new(TransportErrorKind::ChannelMultiplexerClosed, "connection to the server failed");
        let closed = self.transition(|s| matches!(s, Lifecycle::Open(d) if Arc::ptr_eq(d, dispatcher)).then(|| Lifecycle::Closed(Some(reason.clone()))));
        if closed.is_none() {
            return;
        }

        debug!("connection to {} failed, closing channel", self.endpoint);
        if let Some(handle) = self.idle_timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        dispatcher.close(reason).await;
    }
}

/// Settles a channel that is still opening when the open task ends without settling it, i.e.
///  when the task panics
struct CloseIfUnsettled<'a>(&'a Channel);

impl Drop for CloseIfUnsettled<'_> {
    fn drop(&mut self) {
        self.0.transition(|s| (!s.is_settled()).then(|| Lifecycle::Closed(Some(
            TransportError::new(TransportErrorKind::Unknown, "opening the channel was aborted")
        ))));
    }
}

async fn watch_connection(channel: Weak<Channel>, dispatcher: Arc<Dispatcher>) {
    dispatcher.stopped().await;
    if let Some(channel) = channel.upgrade() {
        channel.close_broken(&dispatcher).await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for task in [&mut self.open_task, &mut self.idle_timer, &mut self.connection_watch] {
            if let Some(handle) = task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl TransportChannel for Channel {
    async fn call(&self, request: &ServiceRequest, replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
        Channel::call(self, request, replica_path, activity_id).await
    }

    fn is_healthy(&self) -> bool {
        Channel::is_healthy(self)
    }

    async fn open(&self) -> Result<(), TransportError> {
        Channel::open(self).await
    }

    async fn close(&self) {
        Channel::close(self).await
    }
}

/// The configured idle timeout, capped by the server's if the server advertises a shorter one.
///  Idle detection stays off if it is not configured.
fn effective_idle_timeout(configured: Option<Duration>, context: &ContextResponse) -> Option<Duration> {
    let configured = configured?;
    match context.idle_timeout_secs {
        Some(secs) if secs > 0 => Some(configured.min(Duration::from_secs(secs.into()))),
        _ => Some(configured),
    }
}
