use super::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn default_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Deserialize)]
pub(super) struct TcpParams {
    #[serde(default = "default_host")]
    host: String,
    port: u16,
    #[serde(default)]
    name: Option<String>,
}

/// Plain TCP transport (raw sockets, telnet-less line services).
pub struct TcpTransport {
    host: String,
    port: u16,
    connection: Arc<ObservableConnection>,
    pending: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(connection: Arc<ObservableConnection>, host: impl Into<String>, port: u16) -> Self {
        let (outgoing, receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        connection.connection().set_how2send(move |data| {
            outgoing
                .send(data)
                .map_err(|_| ConnectError::ConnectClosedError)
        });
        Self {
            host: host.into(),
            port,
            connection,
            pending: Mutex::new(Some(receiver)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn from_params(params: TcpParams) -> Self {
        let connection = Arc::new(ObservableConnection::new(Connection::new(params.name)));
        Self::new(connection, params.host, params.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Transport for TcpTransport {
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
                "tcp transport '{}' can be opened only once",
                self.name()
            )));
        };

        let stream = match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                // Keep the queue so a later open can retry.
                *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
                return Err(e.into());
            }
        };
        debug!("connection '{}' opened tcp {}", self.name(), self.address());
        self.connection.connection().record(SessionEvent::ConnectionOpened {
            connection: self.name().to_string(),
        });
        let (mut reader, mut writer) = stream.into_split();

        let connection = Arc::clone(&self.connection);
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("{}: connection closed by peer", connection.name());
                        connection.connection().record(SessionEvent::ConnectionClosed {
                            connection: connection.name().to_string(),
                            reason: "closed by peer".to_string(),
                        });
                        break;
                    }
                    Ok(n) => connection.data_received(&buf[..n]),
                    Err(e) => {
                        debug!("{}: read error: {e}", connection.name());
                        break;
                    }
                }
            }
        });

        let label = self.name().to_string();
        let write_task = tokio::spawn(async move {
            while let Some(data) = receiver.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("{label}: write error: {e}");
                    break;
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(read_task);
        tasks.push(write_task);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectError> {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }
        for task in tasks {
            task.abort();
        }
        debug!("connection '{}' closed tcp {}", self.name(), self.address());
        self.connection.connection().record(SessionEvent::ConnectionClosed {
            connection: self.name().to_string(),
            reason: "closed by caller".to_string(),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        !tasks.is_empty() && tasks.iter().all(|task| !task.is_finished())
    }
}
