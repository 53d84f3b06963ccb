//! src/worker.rs
//!
//! One worker: its event loop and the controller-side handle.
//!
//! # Worker lifecycle
//! 1. Record its identity, run the init hook, shard the pipeline
//! 2. Serve requests in order, one response per request
//! 3. On `Terminate`: acknowledge and exit
//!
//! The worker shares nothing with the controller except its own channel
//! pair. If the worker dies (panic, failed init hook) its response sender is
//! dropped, which the handle observes as a disconnected channel.
//!
//! # Handle invariants
//! - At most one `NextItem` is outstanding at a time. A `Busy` poll never
//!   re-sends it.
//! - An outstanding `NextItem` is drained before reset, reseed or terminate,
//!   so responses never shift out of correspondence with requests.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::any::Any;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::common::thread::{set_current_worker, WorkerInfo};
use crate::config::{MultiProcessingConfig, StartMethod, WorkerInitFn};
use crate::error::{Component, ReadingServiceError, Result};
use crate::pipeline::DataPipe;
use crate::protocol::{Request, Response};

/// Result of a non-blocking poll.
#[derive(Debug, PartialEq, Eq)]
pub enum TryNext<T> {
    Value(T),
    EndOfStream,
    /// Nothing ready yet, poll again later.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Terminating,
    Terminated,
}

/// Controller-side handle to one worker.
pub(crate) struct WorkerHandle<T> {
    id: usize,
    thread: Option<JoinHandle<()>>,
    request_tx: Sender<Request>,
    response_rx: Receiver<Response<T>>,
    // Set while a `NextItem` is unanswered.
    outstanding_since: Option<Instant>,
    exhausted: bool,
    lifecycle: Lifecycle,
    response_timeout: Duration,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawns a worker running `pipe` as shard `info.id` of `info.num_workers`.
    pub(crate) fn spawn<P>(
        info: WorkerInfo,
        pipe: P,
        config: &MultiProcessingConfig,
    ) -> Result<Self>
    where
        P: DataPipe<Item = T>,
    {
        // Capacity 1 on both sides: the controller never has more than one
        // request unanswered.
        let (request_tx, request_rx) = bounded::<Request>(1);
        let (response_tx, response_rx) = bounded::<Response<T>>(1);
        let init = config.worker_init_fn.clone();

        let mut builder = thread::Builder::new().name(format!("reading-worker-{}", info.id));
        if let StartMethod::ThreadWithStack(size) = config.start_method {
            builder = builder.stack_size(size);
        }

        let thread = builder
            .spawn(move || run_worker(info, pipe, init, request_rx, response_tx))
            .map_err(|source| ReadingServiceError::Spawn {
                worker: info.id,
                source,
            })?;

        debug!(worker = info.id, num_workers = info.num_workers, "Spawned worker");

        let mut handle =
            Self::from_channels(info.id, request_tx, response_rx, config.response_timeout);
        handle.thread = Some(thread);
        Ok(handle)
    }
}

impl<T> WorkerHandle<T> {
    /// Wraps an existing channel pair without a thread to join.
    pub(crate) fn from_channels(
        id: usize,
        request_tx: Sender<Request>,
        response_rx: Receiver<Response<T>>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            id,
            thread: None,
            request_tx,
            response_rx,
            outstanding_since: None,
            exhausted: false,
            lifecycle: Lifecycle::Running,
            response_timeout,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn receiver(&self) -> &Receiver<Response<T>> {
        &self.response_rx
    }

    /// Non-blocking next: sends `NextItem` unless one is already outstanding,
    /// then checks for the answer without waiting.
    pub(crate) fn try_next(&mut self) -> Result<TryNext<T>> {
        if self.lifecycle != Lifecycle::Running {
            return Err(ReadingServiceError::crash(self.id, "polled after termination"));
        }
        if self.exhausted {
            return Ok(TryNext::EndOfStream);
        }

        let since = match self.outstanding_since {
            Some(since) => since,
            None => {
                self.send(Request::NextItem)?;
                *self.outstanding_since.insert(Instant::now())
            }
        };

        match self.response_rx.try_recv() {
            Ok(response) => {
                self.outstanding_since = None;
                self.accept_next(response)
            }
            Err(TryRecvError::Empty) => {
                if since.elapsed() > self.response_timeout {
                    return Err(ReadingServiceError::crash(
                        self.id,
                        format!("no response to NextItem within {:?}", self.response_timeout),
                    ));
                }
                Ok(TryNext::Busy)
            }
            Err(TryRecvError::Disconnected) => Err(ReadingServiceError::crash(
                self.id,
                "response channel disconnected with a NextItem outstanding",
            )),
        }
    }

    fn accept_next(&mut self, response: Response<T>) -> Result<TryNext<T>> {
        match response {
            Response::Value(value) => Ok(TryNext::Value(value)),
            Response::EndOfStream => {
                self.exhausted = true;
                Ok(TryNext::EndOfStream)
            }
            Response::Busy => Ok(TryNext::Busy),
            Response::Failed(source) => Err(ReadingServiceError::Pipeline {
                component: Component::Worker(self.id),
                source,
            }),
            other => Err(ReadingServiceError::violation(
                self.id,
                format!("{} in answer to NextItem", other.tag()),
            )),
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.request_tx.send(request).map_err(|_| {
            ReadingServiceError::crash(
                self.id,
                format!("request channel closed before {:?}", request),
            )
        })
    }

    /// Consumes the answer to an outstanding `NextItem`, if any.
    fn drain(&mut self) -> Result<()> {
        let Some(since) = self.outstanding_since.take() else {
            return Ok(());
        };

        let remaining = self.response_timeout.saturating_sub(since.elapsed());
        match self.response_rx.recv_timeout(remaining) {
            Ok(response) if response.answers(Request::NextItem) => {
                if let Response::EndOfStream = response {
                    self.exhausted = true;
                }
                debug!(worker = self.id, tag = response.tag(), "Drained outstanding response");
                Ok(())
            }
            Ok(response) => Err(ReadingServiceError::violation(
                self.id,
                format!("{} in answer to NextItem", response.tag()),
            )),
            Err(RecvTimeoutError::Timeout) => Err(ReadingServiceError::crash(
                self.id,
                format!("no response to NextItem within {:?}", self.response_timeout),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(ReadingServiceError::crash(
                self.id,
                "response channel disconnected with a NextItem outstanding",
            )),
        }
    }

    /// Blocks until the answer to a control request arrives.
    fn await_answer(&mut self, request: Request, timeout: Duration) -> Result<()> {
        match self.response_rx.recv_timeout(timeout) {
            Ok(response) if response.answers(request) => Ok(()),
            Ok(response) => Err(ReadingServiceError::violation(
                self.id,
                format!("{} in answer to {:?}", response.tag(), request),
            )),
            Err(RecvTimeoutError::Timeout) => Err(ReadingServiceError::Timeout {
                component: Component::Worker(self.id),
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ReadingServiceError::crash(
                self.id,
                format!("exited before answering {:?}", request),
            )),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running => Ok(()),
            _ => Err(ReadingServiceError::Precondition(format!(
                "worker {} is already terminated",
                self.id
            ))),
        }
    }

    /// First half of a reset: drain, then send `ResetIteration`.
    pub(crate) fn begin_reset(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.drain()?;
        self.send(Request::ResetIteration)?;
        self.exhausted = false;
        Ok(())
    }

    /// Second half of a reset: wait for `ResetAck`.
    pub(crate) fn finish_reset(&mut self, timeout: Duration) -> Result<()> {
        self.await_answer(Request::ResetIteration, timeout)
    }

    pub(crate) fn begin_reseed(&mut self, seed: u64) -> Result<()> {
        self.ensure_running()?;
        self.drain()?;
        self.send(Request::Reseed(seed))
    }

    pub(crate) fn finish_reseed(&mut self, timeout: Duration) -> Result<()> {
        self.await_answer(Request::Reseed(0), timeout)
    }

    /// First half of the termination handshake.
    ///
    /// Returns `Ok(false)` when the worker was already terminated, in which
    /// case nothing is sent.
    pub(crate) fn begin_terminate(&mut self) -> Result<bool> {
        if self.lifecycle != Lifecycle::Running {
            return Ok(false);
        }

        if let Err(e) = self.drain().and_then(|_| self.send(Request::Terminate)) {
            self.lifecycle = Lifecycle::Terminated;
            self.join_after_failure();
            return Err(e);
        }

        self.lifecycle = Lifecycle::Terminating;
        Ok(true)
    }

    /// Second half: wait for `TerminateAck`, then join.
    pub(crate) fn finish_terminate(&mut self, timeout: Duration) -> Result<()> {
        if self.lifecycle != Lifecycle::Terminating {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Terminated;

        match self.await_answer(Request::Terminate, timeout) {
            Ok(()) => self.join(),
            Err(e @ ReadingServiceError::Timeout { .. }) => {
                // A hung worker would block `join` forever; detach it instead.
                warn!(worker = self.id, "Worker did not acknowledge Terminate, detaching");
                self.thread.take();
                Err(e)
            }
            Err(e) => {
                self.join_after_failure();
                Err(e)
            }
        }
    }

    fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|payload| {
                let message = panic_message(&*payload);
                ReadingServiceError::crash(self.id, format!("panicked: {}", message))
            }),
            None => Ok(()),
        }
    }

    // The worker is known to be gone or going; its own error has already
    // been captured, so a panic payload is only logged.
    fn join_after_failure(&mut self) {
        let finished = self.thread.as_ref().is_some_and(|t| t.is_finished());
        if finished {
            if let Err(e) = self.join() {
                warn!(worker = self.id, "{}", e);
            }
        } else {
            self.thread.take();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker event loop. Runs until `Terminate` or until the controller drops
/// its end of the request channel.
fn run_worker<P: DataPipe>(
    info: WorkerInfo,
    mut pipe: P,
    init: Option<WorkerInitFn>,
    requests: Receiver<Request>,
    responses: Sender<Response<P::Item>>,
) {
    set_current_worker(info);

    if let Some(hook) = init {
        if let Err(e) = hook(info) {
            // Dropping `responses` surfaces this as a crash on the controller.
            error!(worker = info.id, "Worker init hook failed: {:#}", e);
            return;
        }
    }

    pipe.apply_sharding(info.num_workers, info.id);

    let mut pass: Option<P::Iter> = None;
    let mut exhausted = false;

    while let Ok(request) = requests.recv() {
        let response = match request {
            Request::NextItem if exhausted => Response::EndOfStream,
            Request::NextItem => {
                let items = pass.get_or_insert_with(|| pipe.iter());
                match items.next() {
                    Some(Ok(item)) => Response::Value(item),
                    Some(Err(e)) => Response::Failed(
                        e.context(format!("Worker {} failed to produce an item", info.id)),
                    ),
                    None => {
                        exhausted = true;
                        pass = None;
                        Response::EndOfStream
                    }
                }
            }
            Request::ResetIteration => {
                pass = Some(pipe.iter());
                exhausted = false;
                Response::ResetAck
            }
            Request::Reseed(seed) => {
                pipe.apply_seed(seed);
                Response::Reseeded
            }
            Request::Terminate => {
                drop(pass.take());
                let _ = responses.send(Response::TerminateAck);
                break;
            }
        };

        if responses.send(response).is_err() {
            break; // Controller dropped its receiver
        }
    }

    debug!(worker = info.id, "Worker exiting");
}
