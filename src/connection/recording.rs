use super::*;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record key events only (connection and command lifecycle, secrets).
    KeyEventsOnly,
    /// Record key events and every sent/received data chunk.
    #[default]
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Options for normalizing JSONL recordings into stable fixtures.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Keep received data chunks.
    pub keep_received: bool,
    /// Keep sent data chunks.
    pub keep_sent: bool,
    /// Keep connection opened/closed events.
    pub keep_connection_events: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            keep_received: true,
            keep_sent: false,
            keep_connection_events: true,
        }
    }
}

/// Supported recorded event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionOpened {
        connection: String,
    },
    ConnectionClosed {
        connection: String,
        reason: String,
    },
    Sent {
        data: String,
    },
    /// A secret line was sent; only its fingerprint is kept.
    SecretSent {
        fingerprint: String,
    },
    Received {
        data: String,
    },
    CommandStarted {
        command: String,
    },
    CommandFinished {
        command: String,
        success: bool,
        #[serde(default)]
        result: Vec<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl SessionEvent {
    fn is_data_chunk(&self) -> bool {
        matches!(self, SessionEvent::Sent { .. } | SessionEvent::Received { .. })
    }
}

/// Short, stable fingerprint of a secret: the first 8 bytes of its SHA-256, hex encoded.
pub fn secret_fingerprint(secret: &str) -> String {
    Sha256::digest(secret.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// In-memory session recorder.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    /// Create a recorder with the given level.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record an event, honoring the recording level.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), ConnectError> {
        match self.level {
            SessionRecordLevel::Off => return Ok(()),
            SessionRecordLevel::KeyEventsOnly if event.is_data_chunk() => return Ok(()),
            _ => {}
        }
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("record lock error: {e}")))?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, ConnectError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    pub fn clear(&self) -> Result<(), ConnectError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("record lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, ConnectError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry).map_err(|e| {
                ConnectError::InternalServerError(format!("record encode error: {e}"))
            })?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Restore recorder from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        let recorder = Self::new(SessionRecordLevel::Full);
        if jsonl.trim().is_empty() {
            return Ok(recorder);
        }

        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionRecordEntry = serde_json::from_str(line).map_err(|e| {
                ConnectError::InternalServerError(format!("record decode error: {e}"))
            })?;
            parsed.push(entry);
        }

        let mut guard = recorder
            .entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("record lock error: {e}")))?;
        *guard = parsed;
        drop(guard);

        Ok(recorder)
    }

    /// Normalize JSONL recording content into a stable fixture representation.
    ///
    /// Events are sorted by timestamp (ties keep recording order), then
    /// filtered according to `options`.
    pub fn normalize_jsonl(jsonl: &str, options: NormalizeOptions) -> Result<String, ConnectError> {
        let recorder = Self::from_jsonl(jsonl)?;
        let mut indexed = recorder
            .entries()?
            .into_iter()
            .enumerate()
            .collect::<Vec<(usize, SessionRecordEntry)>>();

        indexed
            .sort_by(|(idx_a, a), (idx_b, b)| a.ts_ms.cmp(&b.ts_ms).then_with(|| idx_a.cmp(idx_b)));

        let filtered = indexed
            .into_iter()
            .filter_map(|(_, entry)| match &entry.event {
                SessionEvent::Received { .. } if !options.keep_received => None,
                SessionEvent::Sent { .. } if !options.keep_sent => None,
                SessionEvent::ConnectionOpened { .. } | SessionEvent::ConnectionClosed { .. }
                    if !options.keep_connection_events =>
                {
                    None
                }
                _ => Some(entry),
            })
            .collect::<Vec<_>>();

        let normalized = SessionRecorder {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(filtered)),
        };
        normalized.to_jsonl()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

/// Recorded terminal outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub success: bool,
    pub result: Vec<String>,
    pub error: Option<String>,
}

/// Offline replayer backed by session recording data.
///
/// Feeds recorded received chunks into a connection so automatons can be
/// exercised without a live transport.
#[derive(Debug, Clone)]
pub struct SessionReplayer {
    entries: Vec<SessionRecordEntry>,
    cursor: usize,
}

impl SessionReplayer {
    pub fn from_recorder(recorder: &SessionRecorder) -> Self {
        let entries = recorder.entries().unwrap_or_default();
        Self { entries, cursor: 0 }
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        let recorder = SessionRecorder::from_jsonl(jsonl)?;
        Ok(Self::from_recorder(&recorder))
    }

    /// Name of the connection the recording was taken on, if recorded.
    pub fn connection_name(&self) -> Option<&str> {
        self.entries.iter().find_map(|entry| match &entry.event {
            SessionEvent::ConnectionOpened { connection } => Some(connection.as_str()),
            _ => None,
        })
    }

    /// Commands started in the recording, in order.
    pub fn commands(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.event {
                SessionEvent::CommandStarted { command } => Some(command.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All received chunks, in order.
    pub fn received(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.event {
                SessionEvent::Received { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Recorded outgoing data, in order. Secrets appear as their fingerprint.
    pub fn sent(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.event {
                SessionEvent::Sent { data } => Some(data.clone()),
                SessionEvent::SecretSent { fingerprint } => Some(format!("***{fingerprint}")),
                _ => None,
            })
            .collect()
    }

    /// Injects every recorded received chunk into `connection`, in order.
    ///
    /// Returns the number of chunks delivered.
    pub fn replay_into(&self, connection: &ObservableConnection) -> Result<usize, ConnectError> {
        let chunks = self.received();
        if chunks.is_empty() {
            return Err(ConnectError::ReplayMismatchError(
                "recording holds no received data".to_string(),
            ));
        }
        for chunk in &chunks {
            connection.inject(chunk);
        }
        Ok(chunks.len())
    }

    /// Delivers the received chunks recorded for the next finished command.
    ///
    /// Chunks are replayed from the cursor up to the next `command_finished`
    /// event for `command`; the recorded outcome is returned for comparison.
    pub fn replay_next(
        &mut self,
        command: &str,
        connection: &ObservableConnection,
    ) -> Result<RecordedOutcome, ConnectError> {
        let mut delivered = 0usize;
        while self.cursor < self.entries.len() {
            let entry = &self.entries[self.cursor];
            self.cursor += 1;

            match &entry.event {
                SessionEvent::Received { data } => {
                    connection.inject(data);
                    delivered += 1;
                }
                SessionEvent::CommandFinished {
                    command: recorded,
                    success,
                    result,
                    error,
                } if recorded == command => {
                    debug!("replayed {delivered} chunk(s) for '{command}'");
                    return Ok(RecordedOutcome {
                        success: *success,
                        result: result.clone(),
                        error: error.clone(),
                    });
                }
                _ => {}
            }
        }

        Err(ConnectError::ReplayMismatchError(format!(
            "no recorded outcome found for command '{command}'"
        )))
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
