use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;
use crate::connection::frame_reader::ReceivedFrame;
use crate::error::{TransportError, TransportErrorKind};

pub type CallResult = Result<ReceivedFrame, TransportError>;

struct PendingCall {
    activity_id: Uuid,
    reply: oneshot::Sender<CallResult>,
}

enum TableStatus {
    Accepting,
    /// terminal; the error is what late callers are told
    Closed(TransportError),
}

/// The calls in flight on one connection, by transport request id. Every registered call is
///  resolved exactly once: by its response, by connection failure, or by removal when the caller
///  gives up on it.
pub struct CallTable {
    calls: FxHashMap<u32, PendingCall>,
    next_request_id: u32,
    status: TableStatus,
}

impl CallTable {
    pub fn new() -> CallTable {
        CallTable {
            calls: FxHashMap::default(),
            next_request_id: 1,
            status: TableStatus::Accepting,
        }
    }

    pub fn is_accepting(&self) -> bool {
        matches!(self.status, TableStatus::Accepting)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Allocates a request id and registers a call under it
    pub fn register(&mut self, activity_id: Uuid) -> Result<(u32, oneshot::Receiver<CallResult>), TransportError> {
        if let TableStatus::Closed(reason) = &self.status {
            // a deliberate close is reported as such, a failed connection as the multiplexer
            //  having stopped
            let kind = match reason.kind {
                TransportErrorKind::ChannelClosed => TransportErrorKind::ChannelClosed,
                _ => TransportErrorKind::ChannelMultiplexerClosed,
            };
            return Err(TransportError::new(kind, format!("no longer accepting calls: {}", reason.detail)));
        }

        // ids wrap around, skipping ids still in use by long-running calls
        let mut request_id = self.next_request_id;
        while self.calls.contains_key(&request_id) {
            request_id = request_id.wrapping_add(1);
        }
        self.next_request_id = request_id.wrapping_add(1);

        let (reply, response) = oneshot::channel();
        self.calls.insert(request_id, PendingCall { activity_id, reply });
        Ok((request_id, response))
    }

    /// Resolves a call. Returns `false` if no call was registered under the id, e.g. because it
    ///  timed out.
    pub fn complete(&mut self, request_id: u32, result: CallResult) -> bool {
        match self.calls.remove(&request_id) {
            Some(call) => {
                trace!(request_id, activity_id = ?call.activity_id, "completing call");
                // NB: the caller may have stopped waiting in the meantime
                let _ = call.reply.send(result);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, request_id: u32) -> bool {
        self.calls.remove(&request_id).is_some()
    }

    /// Stops accepting calls and fails every pending call with `error`. The first reason
    ///  sticks. Returns the number of calls that were failed.
    pub fn close(&mut self, error: TransportError) -> usize {
        if self.is_accepting() {
            self.status = TableStatus::Closed(error.clone());
        }

        let num_failed = self.calls.len();
        for (request_id, call) in self.calls.drain() {
            trace!(request_id, activity_id = ?call.activity_id, "failing call: {:?}", error.kind);
            let _ = call.reply.send(Err(error.clone().with_activity_id(call.activity_id)));
        }
        num_failed
    }
}
