use std::time::Duration;
use uuid::Uuid;

/// The distinct failure categories of the transport layer. Callers above the transport use them
///  to decide where (and whether) to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    // connection establishment
    DnsResolutionFailed,
    ConnectFailed,
    ConnectTimeout,
    SslNegotiationFailed,
    SslNegotiationTimeout,
    TransportNegotiationFailed,
    TransportNegotiationTimeout,
    ChannelOpenTimeout,

    // request / response
    SendFailed,
    SendTimeout,
    ReceiveFailed,
    ReceiveStreamClosed,
    ReceiveTimeout,
    ConnectionBroken,
    InternalServerError,

    // lifecycle and admission
    ChannelMultiplexerClosed,
    ChannelClosed,
    ChannelFull,
    InvalidRequestHeader,
    Unknown,
}

impl TransportErrorKind {
    pub fn is_timeout(self) -> bool {
        use TransportErrorKind::*;
        matches!(self, ConnectTimeout | SslNegotiationTimeout | TransportNegotiationTimeout | ChannelOpenTimeout | SendTimeout | ReceiveTimeout)
    }

    /// true for failures that happened while establishing the connection, i.e. before any
    ///  request could have been sent
    pub fn is_open_failure(self) -> bool {
        use TransportErrorKind::*;
        matches!(self, DnsResolutionFailed | ConnectFailed | ConnectTimeout | SslNegotiationFailed | SslNegotiationTimeout
            | TransportNegotiationFailed | TransportNegotiationTimeout | ChannelOpenTimeout)
    }
}

/// How the layer above the transport should react to a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// retry against a different replica; the request was not processed by the server
    RetryElsewhere,
    /// the request may or may not have been processed; surface as 'service unavailable'
    ServiceUnavailable,
    /// local capacity exhausted; back off before retrying
    Throttled,
    /// the request itself is invalid and will fail anywhere
    BadRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallTimings {
    /// time spent waiting for the channel to open and for the write lock
    pub wait: Duration,
    pub send: Duration,
    pub receive: Duration,
}

/// Details of a rejected context negotiation, as reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationFailure {
    pub status: u32,
    pub required_client_version: Option<String>,
    pub required_protocol_version: Option<u32>,
    pub server_agent: Option<String>,
    pub server_message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {detail} (server: {server:?}, activity id: {activity_id:?}, payload sent: {payload_sent})")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
    pub server: Option<String>,
    pub activity_id: Option<Uuid>,
    /// whether the request may have reached the server, i.e. whether retrying elsewhere could
    ///  execute a non-idempotent request twice
    pub payload_sent: bool,
    pub timings: CallTimings,
    pub negotiation: Option<Box<NegotiationFailure>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> TransportError {
        TransportError {
            kind,
            detail: detail.into(),
            server: None,
            activity_id: None,
            payload_sent: false,
            timings: CallTimings::default(),
            negotiation: None,
        }
    }

    pub fn with_server(mut self, server: impl ToString) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn with_activity_id(mut self, activity_id: Uuid) -> Self {
        self.activity_id = Some(activity_id);
        self
    }

    pub fn with_payload_sent(mut self, payload_sent: bool) -> Self {
        self.payload_sent = payload_sent;
        self
    }

    pub fn with_timings(mut self, timings: CallTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_negotiation(mut self, negotiation: NegotiationFailure) -> Self {
        self.negotiation = Some(Box::new(negotiation));
        self
    }

    pub fn with_kind(mut self, kind: TransportErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn disposition(&self) -> RetryDisposition {
        use TransportErrorKind::*;

        match self.kind {
            InvalidRequestHeader => RetryDisposition::BadRequest,
            ChannelFull => RetryDisposition::Throttled,
            _ if self.kind.is_open_failure() => RetryDisposition::RetryElsewhere,
            ChannelMultiplexerClosed | ChannelClosed => RetryDisposition::RetryElsewhere,
            _ if !self.payload_sent => RetryDisposition::RetryElsewhere,
            _ => RetryDisposition::ServiceUnavailable,
        }
    }

    /// The status code the layer above should surface for this failure
    pub fn status_code(&self) -> u16 {
        match self.disposition() {
            RetryDisposition::RetryElsewhere => 410,
            RetryDisposition::ServiceUnavailable => 503,
            RetryDisposition::Throttled => 429,
            RetryDisposition::BadRequest => 400,
        }
    }
}
