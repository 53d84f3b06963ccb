//! src/protocol.rs
//!
//! Message vocabulary between a controller and one worker.
//!
//! Each worker owns two one-directional channels:
//!
//! ```text
//!   controller ──Request──▶  worker
//!   controller ◀──Response── worker
//! ```
//!
//! Every `Request` yields exactly one `Response`, in request order (FIFO per
//! worker). There is no ordering across workers.

/// Control and data requests sent to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Produce the next item of the current pass.
    NextItem,
    /// Discard local iteration state and restart from the beginning.
    /// Only valid while no `NextItem` is outstanding.
    ResetIteration,
    /// Release resources, acknowledge, exit.
    Terminate,
    /// Apply an epoch seed to the worker's pipeline before the next reset.
    Reseed(u64),
}

/// Worker answers. `T` is the opaque item payload.
#[derive(Debug)]
pub enum Response<T> {
    /// An item produced for `NextItem`.
    Value(T),
    /// The worker's local pass is exhausted.
    EndOfStream,
    /// No item ready yet; the `NextItem` is consumed and must be re-sent.
    Busy,
    /// The local pipeline failed to produce the requested item.
    Failed(anyhow::Error),
    ResetAck,
    Reseeded,
    TerminateAck,
}

impl<T> Response<T> {
    /// Checks that this response is a legal answer to `request`.
    pub fn answers(&self, request: Request) -> bool {
        match request {
            Request::NextItem => matches!(
                self,
                Response::Value(_) | Response::EndOfStream | Response::Busy | Response::Failed(_)
            ),
            Request::ResetIteration => matches!(self, Response::ResetAck),
            Request::Terminate => matches!(self, Response::TerminateAck),
            Request::Reseed(_) => matches!(self, Response::Reseeded),
        }
    }

    /// Tag name used in logs and protocol errors.
    pub fn tag(&self) -> &'static str {
        match self {
            Response::Value(_) => "Value",
            Response::EndOfStream => "EndOfStream",
            Response::Busy => "Busy",
            Response::Failed(_) => "Failed",
            Response::ResetAck => "ResetAck",
            Response::Reseeded => "Reseeded",
            Response::TerminateAck => "TerminateAck",
        }
    }
}
