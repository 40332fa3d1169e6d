//! Byte transports feeding an [`ObservableConnection`].
//!
//! A transport installs the connection's outgoing callback and calls
//! [`ObservableConnection::data_received`] for every chunk it reads. Sends
//! are queued to a pump task, so dispatch never re-enters itself through a
//! transport that answers synchronously.

use async_trait::async_trait;
use log::{debug, trace};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::connection::{
    Connection, ConnectionFactory, ConnectionParams, ObservableConnection, SessionEvent,
};
use crate::error::ConnectError;

pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::SshTransport;
pub use tcp::TcpTransport;

mod security;
mod ssh;
mod tcp;

/// Variant name under which the built-in transports are registered.
pub const DEFAULT_VARIANT: &str = "tokio";

/// Lifecycle of an external byte channel bound to a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn connection(&self) -> &Arc<ObservableConnection>;

    /// Opens the channel and starts delivering received data.
    async fn open(&self) -> Result<(), ConnectError>;

    async fn close(&self) -> Result<(), ConnectError>;

    fn is_open(&self) -> bool;
}

/// Registers the `memory`, `tcp` and `ssh` transports under [`DEFAULT_VARIANT`].
pub fn register_builtin_transports(factory: &ConnectionFactory) {
    factory.register("memory", DEFAULT_VARIANT, |params| {
        let params: MemoryParams = parse_params(params)?;
        let connection = Arc::new(ObservableConnection::new(Connection::new(params.name)));
        Ok(Box::new(MemoryTransport::new(connection, params.echo)) as Box<dyn Transport>)
    });
    factory.register("tcp", DEFAULT_VARIANT, |params| {
        let params: tcp::TcpParams = parse_params(params)?;
        Ok(Box::new(TcpTransport::from_params(params)) as Box<dyn Transport>)
    });
    factory.register("ssh", DEFAULT_VARIANT, |params| {
        let params: ssh::SshParams = parse_params(params)?;
        Ok(Box::new(SshTransport::from_params(params)) as Box<dyn Transport>)
    });
}

fn parse_params<T: DeserializeOwned>(params: ConnectionParams) -> Result<T, ConnectError> {
    serde_json::from_value(serde_json::Value::Object(params))
        .map_err(|e| ConnectError::InvalidConfig(format!("invalid connection parameters: {e}")))
}

fn default_echo() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MemoryParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_echo")]
    echo: bool,
}

/// In-process FIFO transport.
///
/// Bytes given to [`MemoryTransport::inject`] are delivered to the connection
/// in order. With `echo` enabled, everything sent is also looped back, like
/// a terminal echoing typed input. Data queued before [`Transport::open`] is
/// delivered once the transport opens.
pub struct MemoryTransport {
    connection: Arc<ObservableConnection>,
    inbound: UnboundedSender<Vec<u8>>,
    pending: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn new(connection: Arc<ObservableConnection>, echo: bool) -> Self {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));

        let loopback = inbound.clone();
        let sink = Arc::clone(&written);
        connection.connection().set_how2send(move |data: Vec<u8>| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(data.clone());
            if echo {
                loopback
                    .send(data)
                    .map_err(|_| ConnectError::ConnectClosedError)?;
            }
            Ok(())
        });

        Self {
            connection,
            inbound,
            pending: Mutex::new(Some(receiver)),
            written,
            pump: Mutex::new(None),
        }
    }

    /// Queues bytes as if the remote end had written them.
    pub fn inject(&self, data: impl Into<Vec<u8>>) -> Result<(), ConnectError> {
        self.inbound
            .send(data.into())
            .map_err(|_| ConnectError::ConnectClosedError)
    }

    /// Everything sent through the connection so far, one entry per send.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// [`MemoryTransport::written`] decoded with the connection's codec.
    pub fn written_text(&self) -> Vec<String> {
        self.written()
            .iter()
            .map(|raw| self.connection.connection().decode(raw))
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        self.connection.name()
    }

    fn connection(&self) -> &Arc<ObservableConnection> {
        &self.connection
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let receiver = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return Err(ConnectError::WrongUsage(format!(
                "memory transport '{}' can be opened only once",
                self.name()
            )));
        };

        let connection = Arc::clone(&self.connection);
        let handle = tokio::spawn(async move {
            while let Some(chunk) = receiver.recv().await {
                trace!("{} memory pump delivering {} byte(s)", connection.name(), chunk.len());
                connection.data_received(&chunk);
            }
            debug!("{} memory pump stopped", connection.name());
        });
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!("memory transport '{}' opened", self.name());
        self.connection.connection().record(SessionEvent::ConnectionOpened {
            connection: self.name().to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectError> {
        if let Some(handle) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            debug!("memory transport '{}' closed", self.name());
            self.connection.connection().record(SessionEvent::ConnectionClosed {
                connection: self.name().to_string(),
                reason: "closed by caller".to_string(),
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
