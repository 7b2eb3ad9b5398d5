//! Turns one client message into one reply line.
//!
//! A message is parsed, admitted, routed by command name, and run as its own task
//! under a bound on how many handlers may run at once. Every outcome, including a
//! panicking handler, becomes a well-formed envelope.

use crate::prelude::*;
use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::batch::BatchError;
use crate::resilience::{BoxFuture, ExecutionError};
use crate::services::Services;
use crate::types::BlockError;
use crate::world::WorldError;

mod args;
mod handlers;
mod request;
mod response;

pub use args::{parse_positions, ArgError, Arguments};
pub use request::{ParseError, Request};
pub use response::{Envelope, ErrorCode, Status};

/// What a handler hands back on success.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub message: String,
    pub data: Option<Value>,
}
impl Reply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Args(#[from] ArgError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("{0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn world_code(e: &WorldError) -> ErrorCode {
    match e {
        WorldError::OutOfBounds(_) => ErrorCode::InvalidParameters,
        WorldError::Rejected { .. } => ErrorCode::PermissionDenied,
        WorldError::Unavailable(_) => ErrorCode::InternalError,
    }
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::Args(ArgError::Block(BlockError::Forbidden(_))) => {
                ErrorCode::PermissionDenied
            }
            CommandError::Args(_) | CommandError::Invalid(_) => ErrorCode::InvalidParameters,
            CommandError::Execution(e) => match e.innermost() {
                ExecutionError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
                ExecutionError::Timeout { .. } => ErrorCode::Timeout,
                ExecutionError::Underlying { .. } => e
                    .root_source()
                    .and_then(|cause| cause.downcast_ref::<WorldError>())
                    .map_or(ErrorCode::InternalError, world_code),
            },
            CommandError::Batch(BatchError::TimedOut { .. }) => ErrorCode::Timeout,
            CommandError::Batch(BatchError::Worker(_)) | CommandError::Internal(_) => {
                ErrorCode::InternalError
            }
            CommandError::World(e) => world_code(e),
        }
    }
}

pub type HandlerResult = Result<Reply, CommandError>;

/// A routed request as a handler sees it.
#[derive(Debug, Clone)]
pub struct Call {
    pub connection_id: String,
    pub args: Arguments,
}

type Handler = Arc<dyn Fn(Arc<Services>, Call) -> BoxFuture<HandlerResult> + Send + Sync>;

struct Command {
    params: &'static [&'static str],
    handler: Handler,
}

/// Command name to handler. Filled at startup, read-only afterwards.
#[derive(Default)]
pub struct Registry {
    commands: HashMap<&'static str, Arc<Command>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(
        &mut self,
        name: &'static str,
        params: &'static [&'static str],
        handler: F,
    )
    where
        F: Fn(Arc<Services>, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |services: Arc<Services>, call: Call| -> BoxFuture<HandlerResult> {
                Box::pin(handler(services, call))
            });
        self.commands.insert(name, Arc::new(Command { params, handler }));
    }

    /// Makes `alias` run whatever `target` runs. Does nothing if `target` is unknown.
    pub fn alias(&mut self, alias: &'static str, target: &str) {
        match self.commands.get(target).cloned() {
            Some(command) => {
                self.commands.insert(alias, command);
            }
            None => log::warn!("alias {alias} points at unknown command {target}"),
        }
    }

    pub fn params(&self, name: &str) -> Option<&'static [&'static str]> {
        self.commands.get(name).map(|c| c.params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn handler(&self, name: &str) -> Option<Handler> {
        self.commands.get(name).map(|c| Arc::clone(&c.handler))
    }

    /// Every built-in command.
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        handlers::register_all(&mut registry);
        registry
    }
}

pub struct Dispatcher {
    services: Arc<Services>,
    registry: Registry,
    in_flight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>, registry: Registry) -> Self {
        let in_flight = Arc::new(Semaphore::new(services.config.server.max_in_flight));
        Self {
            services,
            registry,
            in_flight,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Stops admitting handlers. Requests arriving afterwards, including ones already
    /// waiting for a slot, are answered with `internalError`.
    pub fn close(&self) {
        self.in_flight.close();
        log::info!("dispatcher closed");
    }

    /// The first line a client receives after connecting.
    pub fn welcome(&self, connection_id: &str) -> String {
        Envelope::success(
            "welcome",
            "Connected to blockgate",
            Some(serde_json::json!({
                "connectionId": connection_id,
                "commands": self.registry.len(),
            })),
        )
        .to_line()
    }

    fn failed(&self, command: &str, code: ErrorCode, message: impl Into<String>) -> String {
        self.services.metrics.increment("commands.failed", 1);
        Envelope::error(command, code, message).to_line()
    }

    /// Handles one raw message from `connection_id` and returns the reply line.
    pub async fn handle(&self, raw: &str, connection_id: &str) -> String {
        let max = self.services.config.server.max_message_bytes;
        let request = if raw.len() > max {
            Err(ParseError::TooLong { len: raw.len(), max })
        } else {
            Request::parse(raw, |name| self.registry.params(name))
        };
        let Request { command, args } = match request {
            Ok(request) => request,
            Err(e) => {
                log::debug!("unparseable message from {connection_id}: {e}");
                return self.failed("unknown", ErrorCode::InvalidParameters, e.to_string());
            }
        };

        if !self.services.admission.allow(connection_id) {
            let message = "Rate limit exceeded, slow down";
            return self.failed(&command, ErrorCode::RateLimitExceeded, message);
        }

        let Some(handler) = self.registry.handler(&command) else {
            log::debug!("unknown command {command:?} from {connection_id}");
            let message = format!("Unknown command: {command}");
            return self.failed(&command, ErrorCode::UnknownCommand, message);
        };

        let Ok(permit) = Arc::clone(&self.in_flight).acquire_owned().await else {
            return self.failed(&command, ErrorCode::InternalError, "server is shutting down");
        };
        log::debug!("{connection_id} -> {command} {args:?}");
        let call = Call {
            connection_id: connection_id.to_owned(),
            args,
        };
        let task = tokio::spawn({
            let services = Arc::clone(&self.services);
            async move {
                let _permit = permit;
                handler(services, call).await
            }
        });

        match task.await {
            Ok(Ok(reply)) => {
                self.services.metrics.increment("commands.executed", 1);
                Envelope::success(&command, reply.message, reply.data).to_line()
            }
            Ok(Err(e)) => {
                let code = e.code();
                if code == ErrorCode::InternalError {
                    log::error!("{command} failed for {connection_id}: {e}");
                } else {
                    log::info!("{command} failed for {connection_id}: {e}");
                }
                self.failed(&command, code, e.to_string())
            }
            Err(e) => {
                log::error!("handler for {command} did not complete: {e}");
                self.failed(&command, ErrorCode::InternalError, "Internal error")
            }
        }
    }
}
