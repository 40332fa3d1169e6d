use linewire::command::{CommandAutomaton, Hexdump, Sftp};
use linewire::config::{ConnectionsConfig, NamedConnection};
use linewire::connection::{
    Connection, ConnectionRegistry, ConnectionRequest, ObservableConnection, SessionRecorder,
    SessionReplayer,
};
use linewire::error::{ConnectError, ErrorKind};
use linewire::transport::{MemoryTransport, Transport};
use std::sync::Arc;
use std::time::Duration;

const UPLOAD_OUTPUT: &[&str] = &[
    "xyz@debian:/home$ sftp fred@192.168.0.102\r\n",
    "fred@192.168.0.102's password: ",
    "\r\nConnected to 192.168.0.102.\r\nsftp> ",
    "put notes.txt\r\nUploading notes.txt to /upload/notes.txt\r\n",
    "notes.txt                                     100%   12     3.1KB/s   00:00\r\nsftp> ",
];

fn upload() -> Sftp {
    Sftp::new("192.168.0.102", "1234")
        .with_user("fred")
        .with_command("put notes.txt")
}

#[tokio::test]
async fn sftp_upload_over_memory_transport() {
    let connection = Arc::new(ObservableConnection::new(Connection::new(Some(
        "sftp-box".to_string(),
    ))));
    let recorder = SessionRecorder::default();
    connection.connection().set_recorder(Some(recorder.clone()));
    let transport = MemoryTransport::new(Arc::clone(&connection), false);
    transport.open().await.expect("open");

    let automaton = CommandAutomaton::new(Arc::clone(&connection), upload());
    automaton.start().expect("start");
    for chunk in UPLOAD_OUTPUT {
        transport.inject(*chunk).expect("inject");
    }

    let lines = automaton
        .await_result(Duration::from_secs(5))
        .await
        .expect("upload succeeds");
    assert_eq!(
        lines,
        vec![
            "Uploading notes.txt to /upload/notes.txt".to_string(),
            "notes.txt                                     100%   12     3.1KB/s   00:00".to_string(),
        ]
    );
    assert_eq!(
        transport.written_text(),
        vec![
            "sftp fred@192.168.0.102\n".to_string(),
            "1234\n".to_string(),
            "put notes.txt\n".to_string(),
            "exit\n".to_string(),
        ]
    );
    transport.close().await.expect("close");

    // The recording never carries the password and replays to the same result.
    let jsonl = recorder.to_jsonl().expect("export");
    assert!(!jsonl.contains("1234\\n"));

    let mut replayer = SessionReplayer::from_jsonl(&jsonl).expect("reload");
    assert_eq!(replayer.connection_name(), Some("sftp-box"));
    let offline = Arc::new(ObservableConnection::new(
        Connection::new(None).with_how2send(|_| Ok(())),
    ));
    let replayed = CommandAutomaton::new(Arc::clone(&offline), upload());
    replayed.start().expect("start replay");
    let recorded = replayer
        .replay_next(replayed.command_string(), &offline)
        .expect("recorded outcome");

    assert!(recorded.success);
    assert_eq!(recorded.result, lines);
    assert_eq!(replayed.result().expect("replay succeeds"), lines);
}

#[tokio::test]
async fn silent_remote_times_out_with_partial_result() {
    let connection = Arc::new(ObservableConnection::new(Connection::new(None)));
    let transport = MemoryTransport::new(Arc::clone(&connection), false);
    transport.open().await.expect("open");

    let automaton = CommandAutomaton::new(
        Arc::clone(&connection),
        Hexdump::new(["old"]).expect("valid files"),
    );
    automaton.start().expect("start");
    transport
        .inject("hexdump old\r\n0000000 6741 0a61\r\n")
        .expect("inject");

    let err = match automaton.await_result(Duration::from_millis(200)).await {
        Ok(lines) => panic!("no prompt was sent, got {lines:?}"),
        Err(err) => err,
    };
    match &err {
        ConnectError::CommandTimeout { partial, .. } => {
            assert_eq!(partial, &vec!["0000000 6741 0a61".to_string()]);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(connection.observers().is_empty());
}

#[tokio::test]
async fn named_memory_connection_from_config() {
    let registry = ConnectionRegistry::with_builtins();
    let config = ConnectionsConfig::from_json_str(
        r#"{
            "named_connections": {
                "loopback": { "io_type": "memory", "echo": true }
            },
            "default_variants": { "memory": "tokio" }
        }"#,
    )
    .expect("config");
    registry.load_config(config);

    let transport = registry
        .get_connection(ConnectionRequest::named("loopback"))
        .expect("named connection");
    assert_eq!(transport.name(), "loopback");

    let other = registry
        .get_connection(ConnectionRequest::named("loopback"))
        .expect("second connection");
    assert!(!Arc::ptr_eq(transport.connection(), other.connection()));

    registry.define_connection("scratch", NamedConnection::new("memory"));
    assert!(registry.get_connection(ConnectionRequest::named("scratch")).is_ok());

    let err = match registry.get_connection(ConnectionRequest::named("missing")) {
        Ok(_) => panic!("unknown name must fail"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("missing"));
}
