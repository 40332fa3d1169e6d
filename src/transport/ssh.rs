use super::*;
use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use russh::ChannelMsg;
use std::time::Duration;

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Deserialize)]
pub(super) struct SshParams {
    host: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    user: String,
    password: String,
    #[serde(default)]
    security: SecurityLevel,
    #[serde(default)]
    name: Option<String>,
}

/// Interactive shell over SSH (pty + shell request).
///
/// The connection sees the raw terminal stream, so automatons run against it
/// exactly as they would against a local terminal.
pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    password: String,
    security: ConnectionSecurityOptions,
    connection: Arc<ObservableConnection>,
    pending: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
    client: Mutex<Option<Client>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl SshTransport {
    pub fn new(
        connection: Arc<ObservableConnection>,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        security: ConnectionSecurityOptions,
    ) -> Self {
        let (outgoing, receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        connection.connection().set_how2send(move |data| {
            outgoing
                .send(data)
                .map_err(|_| ConnectError::ChannelDisconnectError)
        });
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            security,
            connection,
            pending: Mutex::new(Some(receiver)),
            client: Mutex::new(None),
            io_task: Mutex::new(None),
        }
    }

    pub(super) fn from_params(params: SshParams) -> Self {
        let connection = Arc::new(ObservableConnection::new(Connection::new(params.name)));
        let security = ConnectionSecurityOptions::for_level(params.security);
        Self::new(
            connection,
            params.host,
            params.port,
            params.user,
            params.password,
            security,
        )
    }

    pub fn device_addr(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn name(&self) -> &str {
        self.connection.name()
    }

    fn connection(&self) -> &Arc<ObservableConnection> {
        &self.connection
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let device_addr = self.device_addr();
        let receiver = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return Err(ConnectError::WrongUsage(format!(
                "ssh transport to {device_addr} can be opened only once"
            )));
        };

        let config = Config {
            preferred: self.security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let connected = Client::connect_with_config(
            (self.host.clone(), self.port),
            &self.user,
            AuthMethod::with_password(&self.password),
            self.security.server_check.clone(),
            config,
        )
        .await;
        let client = match connected {
            Ok(client) => client,
            Err(e) => {
                *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
                return Err(e.into());
            }
        };
        debug!("{device_addr} TCP connection successful");

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{device_addr} Shell request successful");

        let connection = Arc::clone(&self.connection);
        let io_task_device_addr = device_addr.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver.recv() => {
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!("{io_task_device_addr} Failed to send data to shell: {e:?}");
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => connection.data_received(data),
                            ChannelMsg::ExtendedData { ref data, .. } => connection.data_received(data),
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{io_task_device_addr} Shell exited with status code: {exit_status}");
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{io_task_device_addr} Shell sent EOF.");
                                break;
                            }
                            _ => {}
                        }
                    },
                    else => break,
                }
            }
            debug!("{io_task_device_addr} SSH I/O task ended.");
        });

        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        *self.io_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.connection.connection().record(SessionEvent::ConnectionOpened {
            connection: self.name().to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectError> {
        if let Some(handle) = self
            .io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        // Dropping the client tears the session down.
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            debug!("{} SSH session closed", self.device_addr());
            self.connection.connection().record(SessionEvent::ConnectionClosed {
                connection: self.name().to_string(),
                reason: "closed by caller".to_string(),
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        let task_alive = self
            .io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        let client_alive = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|client| !client.is_closed());
        task_alive && client_alive
    }
}
