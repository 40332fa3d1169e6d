//! Connections binding an external byte transport to line-driven observers.
//!
//! A [`Connection`] owns the outgoing path (encode, then hand bytes to the
//! transport callback). An [`ObservableConnection`] adds the incoming path
//! (decode, then notify every subscribed observer).
//!
//! # Main Components
//!
//! - [`Connection`] - Outgoing path with codec, line terminator and logging
//! - [`ObservableConnection`] - Incoming path and subscription fan-out
//! - [`SubscriptionRegistry`] - Non-owning observer bookkeeping
//! - [`ConnectionFactory`] / [`ConnectionRegistry`] - Construction of transports by (type, variant)
//! - [`SessionRecorder`] / [`SessionReplayer`] - Transcript capture and offline replay

use log::{Level, debug, error, log, trace, warn};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::config::{ConnectionsConfig, NamedConnection};
use crate::error::ConnectError;
use crate::transport::{self, Transport};

pub use dispatch::{ObserverKey, SubscriptionRegistry};
pub use factory::{
    ConnectionFactory, ConnectionParams, ConnectionRegistry, ConnectionRequest, Constructor,
    REGISTRY, get_connection,
};
pub use recording::{
    NormalizeOptions, RecordedOutcome, SessionEvent, SessionRecordEntry, SessionRecordLevel,
    SessionRecorder, SessionReplayer, secret_fingerprint,
};

/// Outgoing transport callback installed by a transport.
pub type SendFn = Arc<dyn Fn(Vec<u8>) -> Result<(), ConnectError> + Send + Sync>;

/// Converts text to wire bytes and back.
///
/// Implementations must be mutual inverses for every value they can represent:
/// `decode(&encode(v)) == v`.
pub trait Codec: Send + Sync {
    fn encode(&self, data: &str) -> Vec<u8>;
    fn decode(&self, raw: &[u8]) -> String;
}

/// UTF-8 codec. Invalid input sequences are decoded lossily.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    fn encode(&self, data: &str) -> Vec<u8> {
        data.as_bytes().to_vec()
    }

    fn decode(&self, raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).into_owned()
    }
}

/// ISO-8859-1 codec: every byte maps to the char with the same code point.
///
/// Characters above U+00FF cannot be represented and are sent as `?`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Latin1Codec;

impl Codec for Latin1Codec {
    fn encode(&self, data: &str) -> Vec<u8> {
        data.chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()
    }

    fn decode(&self, raw: &[u8]) -> String {
        raw.iter().map(|&b| char::from(b)).collect()
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn default_log_target(name: &str) -> String {
    format!("linewire::connection::{name}")
}

/// Outgoing side of a connection.
pub struct Connection {
    name: String,
    how2send: RwLock<Option<SendFn>>,
    codec: Arc<dyn Codec>,
    newline: String,
    log_target: Option<String>,
    recorder: RwLock<Option<SessionRecorder>>,
}

impl Connection {
    /// Creates a connection with UTF-8 coding, `"\n"` terminator and no transport.
    ///
    /// A missing or empty name is replaced by a generated, process-unique one.
    pub fn new(name: Option<String>) -> Self {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("conn-{}", NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)));
        let log_target = Some(default_log_target(&name));
        Self {
            name,
            how2send: RwLock::new(None),
            codec: Arc::new(Utf8Codec),
            newline: "\n".to_string(),
            log_target,
            recorder: RwLock::new(None),
        }
    }

    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_newline(mut self, newline: impl Into<String>) -> Self {
        self.newline = newline.into();
        self
    }

    /// Selects the `log` target used for this connection.
    ///
    /// `None` disables logging of data for this connection.
    pub fn with_log_target(mut self, target: Option<String>) -> Self {
        let default_target = default_log_target(&self.name);
        if let Some(custom) = target.as_deref()
            && custom != default_target
        {
            warn!(target: custom, "using '{custom}' logger - not default '{default_target}'");
        }
        self.log_target = target;
        self
    }

    pub fn with_how2send<F>(self, how2send: F) -> Self
    where
        F: Fn(Vec<u8>) -> Result<(), ConnectError> + Send + Sync + 'static,
    {
        self.set_how2send(how2send);
        self
    }

    /// Installs the outgoing transport callback.
    pub fn set_how2send<F>(&self, how2send: F)
    where
        F: Fn(Vec<u8>) -> Result<(), ConnectError> + Send + Sync + 'static,
    {
        let mut guard = self.how2send.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Arc::new(how2send));
    }

    /// Returns true once a transport callback has been installed.
    pub fn has_transport(&self) -> bool {
        self.how2send
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn newline(&self) -> &str {
        &self.newline
    }

    /// Attaches (or detaches) a transcript recorder.
    pub fn set_recorder(&self, recorder: Option<SessionRecorder>) {
        let mut guard = self.recorder.write().unwrap_or_else(PoisonError::into_inner);
        *guard = recorder;
    }

    pub fn recorder(&self) -> Option<SessionRecorder> {
        self.recorder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder() {
            let _ = recorder.record_event(event);
        }
    }

    /// Prepares data for the outgoing transport.
    pub fn encode(&self, data: &str) -> Vec<u8> {
        self.codec.encode(data)
    }

    /// Restores data received from the incoming transport.
    pub fn decode(&self, raw: &[u8]) -> String {
        self.codec.decode(raw)
    }

    /// Sends data over the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::WrongUsage`] if no transport callback was installed,
    /// or the transport's own error if it rejects the data.
    pub fn send(&self, data: &str) -> Result<(), ConnectError> {
        self.log_data(Level::Debug, '>', &format!("{data:?}"));
        self.record(SessionEvent::Sent {
            data: data.to_string(),
        });
        let encoded = self.encode(data);
        self.log_raw('>', &encoded);
        self.transmit(encoded)
    }

    /// Sends data followed by the line terminator.
    pub fn sendline(&self, data: &str) -> Result<(), ConnectError> {
        self.send(&format!("{data}{}", self.newline))
    }

    /// Sends a secret line. The secret never reaches logs or recordings in clear.
    pub fn sendline_secret(&self, secret: &str) -> Result<(), ConnectError> {
        self.log_data(Level::Debug, '>', "***");
        self.record(SessionEvent::SecretSent {
            fingerprint: secret_fingerprint(secret),
        });
        let encoded = self.encode(&format!("{secret}{}", self.newline));
        self.transmit(encoded)
    }

    fn transmit(&self, encoded: Vec<u8>) -> Result<(), ConnectError> {
        let how2send = self
            .how2send
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match how2send {
            Some(how2send) => how2send(encoded),
            None => Err(self.unknown_send(&encoded)),
        }
    }

    fn unknown_send(&self, data: &[u8]) -> ConnectError {
        let msg = format!(
            "can't send('{}'): no outgoing transport installed; pass one with \
             Connection::with_how2send(external_io_send) or install it later with \
             connection.set_how2send(external_io_send)",
            data.escape_ascii()
        );
        if let Some(target) = self.log_target.as_deref() {
            error!(target: target, "{msg}");
        }
        ConnectError::WrongUsage(msg)
    }

    fn log_data(&self, level: Level, direction: char, data: &str) {
        if let Some(target) = self.log_target.as_deref() {
            log!(target: target, level, "{direction} {data}");
        }
    }

    fn log_raw(&self, direction: char, raw: &[u8]) {
        if let Some(target) = self.log_target.as_deref() {
            trace!(target: target, "{direction} raw {}", raw.escape_ascii());
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("newline", &self.newline)
            .field("has_transport", &self.has_transport())
            .finish()
    }
}

/// Connection whose received data is dispatched to subscribed observers.
#[derive(Debug)]
pub struct ObservableConnection {
    connection: Connection,
    observers: SubscriptionRegistry,
}

impl ObservableConnection {
    pub fn new(connection: Connection) -> Self {
        let observers = SubscriptionRegistry::new(connection.name());
        Self {
            connection,
            observers,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn observers(&self) -> &SubscriptionRegistry {
        &self.observers
    }

    pub fn name(&self) -> &str {
        self.connection.name()
    }

    pub fn send(&self, data: &str) -> Result<(), ConnectError> {
        self.connection.send(data)
    }

    pub fn sendline(&self, data: &str) -> Result<(), ConnectError> {
        self.connection.sendline(data)
    }

    pub fn sendline_secret(&self, secret: &str) -> Result<(), ConnectError> {
        self.connection.sendline_secret(secret)
    }

    /// Incoming-IO entry point: transports call this with every received chunk.
    pub fn data_received(&self, raw: &[u8]) {
        self.connection.log_raw('<', raw);
        let decoded = self.connection.decode(raw);
        self.connection
            .log_data(Level::Debug, '<', &format!("{decoded:?}"));
        self.connection.record(SessionEvent::Received {
            data: decoded.clone(),
        });
        self.observers.notify(&decoded);
    }

    /// Encodes `text` and processes it as if the transport had received it.
    pub fn inject(&self, text: &str) {
        let raw = self.connection.encode(text);
        self.data_received(&raw);
    }

    /// Subscribes `callback` bound to `owner` without keeping `owner` alive.
    pub fn subscribe<O>(&self, owner: &Arc<O>, callback: fn(&O, &str)) -> ObserverKey
    where
        O: Send + Sync + 'static,
    {
        self.observers.subscribe(owner, callback)
    }

    /// Subscribes a free function.
    pub fn subscribe_fn(&self, callback: fn(&str)) -> ObserverKey {
        self.observers.subscribe_fn(callback)
    }

    pub fn unsubscribe<O>(&self, owner: &Arc<O>, callback: fn(&O, &str)) -> bool
    where
        O: Send + Sync + 'static,
    {
        self.observers.unsubscribe(owner, callback)
    }

    pub fn unsubscribe_key(&self, key: &ObserverKey) -> bool {
        self.observers.unsubscribe_key(key)
    }
}

mod dispatch;
mod factory;
mod recording;
