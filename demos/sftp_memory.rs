//! Drives an sftp fetch against a scripted in-memory remote and prints the
//! session transcript as JSONL.

use anyhow::Context;
use linewire::command::{CommandAutomaton, Sftp};
use linewire::connection::{Connection, ObservableConnection, SessionRecorder};
use linewire::transport::{MemoryTransport, Transport};
use std::sync::Arc;
use std::time::Duration;

const REMOTE_OUTPUT: &[&str] = &[
    "xyz@debian:/home$ sftp fred@192.168.0.102:cat /home/xyz/Docs/cat\r\n",
    "The authenticity of host '192.168.0.102 (192.168.0.102)' can't be established.\r\n",
    "Are you sure you want to continue connecting (yes/no)? ",
    "yes\r\nfred@192.168.0.102's password: ",
    "\r\nConnected to 192.168.0.102.\r\n",
    "Fetching /upload/cat to /home/xyz/Docs/cat\r\n",
    "/upload/cat                                   100%   23    34.4KB/s   00:00\r\n",
    "xyz@debian:/home$ ",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let connection = Arc::new(ObservableConnection::new(Connection::new(Some(
        "demo".to_string(),
    ))));
    let recorder = SessionRecorder::default();
    connection.connection().set_recorder(Some(recorder.clone()));

    let transport = MemoryTransport::new(Arc::clone(&connection), false);
    transport.open().await?;

    let sftp = Sftp::new("192.168.0.102", "1234")
        .with_user("fred")
        .with_source_path("cat")
        .with_destination_path("/home/xyz/Docs/cat");
    let automaton = CommandAutomaton::new(Arc::clone(&connection), sftp);
    automaton.start()?;

    for chunk in REMOTE_OUTPUT {
        transport.inject(*chunk)?;
    }

    let lines = automaton
        .await_result(Duration::from_secs(5))
        .await
        .context("sftp fetch did not complete")?;
    transport.close().await?;

    println!("result:");
    for line in &lines {
        println!("  {line}");
    }
    println!("sent: {:?}", transport.written_text());
    println!("transcript:\n{}", recorder.to_jsonl()?);
    Ok(())
}
