//! Tokio event loop around a [`Session`].
//!
//! The loop owns the session and is the only thing that touches it. The
//! network layer and API callers talk to it through a cloneable [`Handle`]
//! over an unbounded channel; timers come from [`TokioIo`].
//!
//! ```text
//!   network tasks ──Inbound──┐
//!                            ▼
//!   Handle ──Command──► mpsc ──► EventLoop::run ──► Session<TokioIo>
//!     ▲                              ▲    │
//!     └────── oneshot replies ───────┼────┘
//!                                    │
//!                    TokioIo::next_expired (DelayQueue)
//! ```

use crate::bootstrap::BootstrapOptions;
use crate::config::ClientConfig;
use crate::durability::{DurabilityCommand, DurabilityOptions, DurabilityResult, SetId};
use crate::error::{Error, Result};
use crate::io::TokioIo;
use crate::operation::OperationResponse;
use crate::session::Session;
use crate::transport::{Authenticator, ConfigTransport, KvResponse, PacketScheduler};
use crate::types::{Cas, HostPort, Opcode, OperationId, ServerIndex};
use bytes::Bytes;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Events produced by the network layer.
#[derive(Debug)]
pub enum Inbound {
    /// A push-protocol configuration request completed.
    ConfigFetched { host: HostPort, result: Result<Bytes> },
    /// A data connection delivered a configuration unasked.
    ConfigPushed { host: HostPort, payload: Bytes },
    /// Bytes on the HTTP configuration stream.
    StreamData { host: HostPort, data: Bytes },
    /// The HTTP configuration stream closed.
    StreamClosed { host: HostPort, error: Error },
    KvResponse { id: OperationId, response: KvResponse },
    ServerFailure { server: ServerIndex, error: Error },
    ObserveResponse { set: SetId, server: ServerIndex, body: Bytes },
    ObserveDone { set: SetId, server: ServerIndex, error: Option<Error> },
}

enum Command {
    Inbound(Inbound),
    Bootstrap(oneshot::Sender<Result<()>>),
    Refresh(BootstrapOptions),
    Schedule {
        opcode: Opcode,
        key: Bytes,
        cas: Option<Cas>,
        accepted: oneshot::Sender<Result<OperationId>>,
        outcome: oneshot::Sender<Result<OperationResponse>>,
    },
    Cancel(OperationId),
    Durability {
        keys: Vec<(Bytes, Option<Cas>)>,
        options: DurabilityOptions,
        accepted: oneshot::Sender<Result<SetId>>,
        outcomes: Vec<oneshot::Sender<DurabilityResult>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point into a running [`EventLoop`].
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Handle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::Cancelled)
    }

    /// Feed a network event into the loop.
    pub fn deliver(&self, event: Inbound) -> Result<()> {
        self.send(Command::Inbound(event))
    }

    /// Start the initial bootstrap. The request is queued before this
    /// returns; the future resolves once the bootstrap settles.
    pub fn bootstrap(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sent = self.send(Command::Bootstrap(tx));
        async move {
            sent?;
            rx.await.map_err(|_| Error::Cancelled)?
        }
    }

    /// Request a configuration refresh.
    pub fn refresh(&self, options: BootstrapOptions) -> Result<()> {
        self.send(Command::Refresh(options))
    }

    /// Schedule an operation. Resolves once the loop accepted or rejected
    /// it.
    pub async fn schedule(
        &self,
        opcode: Opcode,
        key: impl Into<Bytes>,
        cas: Option<Cas>,
    ) -> Result<Scheduled> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (outcome, outcome_rx) = oneshot::channel();
        self.send(Command::Schedule {
            opcode,
            key: key.into(),
            cas,
            accepted,
            outcome,
        })?;
        let id = accepted_rx.await.map_err(|_| Error::Cancelled)??;
        Ok(Scheduled {
            id,
            outcome: outcome_rx,
        })
    }

    /// Cancel a scheduled operation.
    pub fn cancel(&self, id: OperationId) -> Result<()> {
        self.send(Command::Cancel(id))
    }

    /// Start a durability poll over `keys`.
    pub async fn observe_durability(
        &self,
        keys: Vec<(Bytes, Option<Cas>)>,
        options: DurabilityOptions,
    ) -> Result<DurabilityWait> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (outcomes, receivers): (Vec<_>, Vec<_>) =
            keys.iter().map(|_| oneshot::channel()).unzip();
        self.send(Command::Durability {
            keys,
            options,
            accepted,
            outcomes,
        })?;
        let set = accepted_rx.await.map_err(|_| Error::Cancelled)??;
        Ok(DurabilityWait { set, receivers })
    }

    /// Stop the loop, failing everything outstanding with
    /// [`Error::Cancelled`].
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// An accepted operation.
#[derive(Debug)]
pub struct Scheduled {
    id: OperationId,
    outcome: oneshot::Receiver<Result<OperationResponse>>,
}

impl Scheduled {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Wait for the final outcome.
    pub async fn wait(self) -> Result<OperationResponse> {
        self.outcome.await.map_err(|_| Error::Cancelled)?
    }
}

/// An accepted durability poll.
#[derive(Debug)]
pub struct DurabilityWait {
    set: SetId,
    receivers: Vec<oneshot::Receiver<DurabilityResult>>,
}

impl DurabilityWait {
    pub fn set(&self) -> SetId {
        self.set
    }

    /// Wait for every key, in request order.
    pub async fn wait(self) -> Result<Vec<DurabilityResult>> {
        let mut results = Vec::with_capacity(self.receivers.len());
        for rx in self.receivers {
            results.push(rx.await.map_err(|_| Error::Cancelled)?);
        }
        Ok(results)
    }
}

/// Owns a [`Session`] and drives it from a channel and its timers.
pub struct EventLoop {
    session: Session<TokioIo>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl EventLoop {
    /// Create a loop and its handle. Must be called inside a tokio runtime.
    pub fn new(
        settings: ClientConfig,
        transport: Box<dyn ConfigTransport>,
        scheduler: Box<dyn PacketScheduler>,
        auth: Box<dyn Authenticator>,
    ) -> (Self, Handle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(settings, TokioIo::new(), transport, scheduler, auth);
        (Self { session, rx }, Handle { tx })
    }

    pub fn session(&self) -> &Session<TokioIo> {
        &self.session
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!(bucket = %self.session.settings().bucket, "Event loop started");
        loop {
            tokio::select! {
                timer = self.session.io_mut().next_expired() => {
                    self.session.on_timer(timer);
                }
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Shutdown(done)) => {
                            self.session.shutdown();
                            let _ = done.send(());
                            break;
                        }
                        Some(command) => self.handle(command),
                        None => {
                            debug!("All handles dropped");
                            self.session.shutdown();
                            break;
                        }
                    }
                }
            }
        }
        info!("Event loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Inbound(event) => self.deliver(event),
            Command::Bootstrap(reply) => self.session.bootstrap(move |result| {
                let _ = reply.send(result);
            }),
            Command::Refresh(options) => self.session.refresh(options),
            Command::Schedule {
                opcode,
                key,
                cas,
                accepted,
                outcome,
            } => {
                let result = self.session.schedule(opcode, key, cas, move |result| {
                    let _ = outcome.send(result);
                });
                let _ = accepted.send(result);
            }
            Command::Cancel(id) => {
                self.session.cancel(id);
            }
            Command::Durability {
                keys,
                options,
                accepted,
                outcomes,
            } => {
                let commands = keys
                    .into_iter()
                    .zip(outcomes)
                    .map(|((key, cas), tx)| {
                        DurabilityCommand::new(key, cas, move |result| {
                            let _ = tx.send(result);
                        })
                    })
                    .collect();
                let _ = accepted.send(self.session.durability_poll(commands, options));
            }
            Command::Shutdown(_) => {}
        }
    }

    fn deliver(&mut self, event: Inbound) {
        match event {
            Inbound::ConfigFetched { host, result } => self.session.on_config_fetched(&host, result),
            Inbound::ConfigPushed { host, payload } => self.session.on_config_pushed(&host, &payload),
            Inbound::StreamData { host, data } => self.session.on_http_stream_data(&host, &data),
            Inbound::StreamClosed { host, error } => self.session.on_http_stream_closed(&host, error),
            Inbound::KvResponse { id, response } => self.session.on_kv_response(id, response),
            Inbound::ServerFailure { server, error } => self.session.on_server_failure(server, error),
            Inbound::ObserveResponse { set, server, body } => {
                if let Err(error) = self.session.on_observe_response(set, server, &body) {
                    debug!(set = %set, server, error = %error, "Dropping malformed observe response");
                }
            }
            Inbound::ObserveDone { set, server, error } => {
                self.session.on_observe_done(set, server, error)
            }
        }
    }
}
