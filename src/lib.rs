//! # linewire - Line-oriented command automatons over observable connections
//!
//! `linewire` drives interactive command-line tools (sftp, gunzip, hexdump, ...)
//! running behind a byte-stream connection. Incoming data is decoded and
//! fanned out to weakly held subscribers; command automatons subscribe,
//! issue their command line, classify every output line through ordered
//! rules and report a result or a classified failure.
//!
//! ## Features
//!
//! - **Observable connections**: Encode/decode, newline handling and weak, non-owning fan-out
//! - **Connection factory**: Transports built by `(io_type, variant)` and named connections from config
//! - **Command automatons**: Prompt answering, result collection, failure classification and timeouts
//! - **Transports**: In-memory, plain TCP and SSH shell (via `async-ssh2-tokio`)
//! - **Recording**: JSONL session transcripts with offline replay
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linewire::command::{CommandAutomaton, Sftp};
//! use linewire::connection::{ConnectionRequest, REGISTRY};
//! use linewire::transport::DEFAULT_VARIANT;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = REGISTRY.get_connection(
//!         ConnectionRequest::typed("ssh")
//!             .with_variant(DEFAULT_VARIANT)
//!             .with_param("host", "192.168.1.1")
//!             .with_param("user", "admin")
//!             .with_param("password", "secret"),
//!     )?;
//!     transport.open().await?;
//!
//!     let sftp = Sftp::new("10.0.0.5", "1234")
//!         .with_user("fred")
//!         .with_source_path("cat")
//!         .with_destination_path("/tmp/cat");
//!     let automaton = CommandAutomaton::new(transport.connection().clone(), sftp);
//!     automaton.start()?;
//!
//!     let lines = automaton.await_result(Duration::from_secs(30)).await?;
//!     println!("{}", lines.join("\n"));
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`connection::ObservableConnection`] - Decoding connection with subscriber fan-out
//! - [`connection::ConnectionRegistry`] - Transport constructors and named connections
//! - [`command::CommandAutomaton`] - Line classification engine
//! - [`error::ConnectError`] - Error types for connections and commands
//! - [`config`] - JSON configuration of named connections

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;
