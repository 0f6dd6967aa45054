#![cfg_attr(docsrs, feature(doc_cfg))]

//! ftp-datalink is the data connection engine of an FTP server: it hands out passive ports from a
//! shared pool, turns PORT and PASV into connected (optionally TLS protected) data sockets, copies
//! files and listings over them and decides which sessions may log in at all.
//!
//! It does not parse FTP commands or talk to storage; a command layer drives a [`Session`] per
//! control connection and sends the [`Reply`] values it gets back.
//!
//! ```no_run
//! use ftp_datalink::{DataConnectionPolicy, DefaultUser, Listener};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = DataConnectionPolicy::builder()
//!     .passive_ports("50000-50100")
//!     .passive_external_address("203.0.113.7")
//!     .build()?;
//! let listener = Listener::builder(policy).build();
//!
//! let Ok(mut session) = listener.new_session("192.0.2.1:40000".parse()?, "10.0.0.2:21".parse()?) else {
//!     return Ok(());
//! };
//! // PASS, once the credentials checked out
//! session.login(&DefaultUser::new("alice")).await;
//! // PASV
//! let reply = session.pasv().await;
//! println!("{}", reply);
//! // RETR, after sending 150
//! let reply = session.retrieve(&b"hello"[..]).await;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

pub mod notification;
pub mod options;
pub(crate) mod server;

#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
pub mod metrics;

pub use crate::server::*;
pub use ftp_datalink_core::auth::{DefaultUser, UserDetail};
pub use ftp_datalink_core::filter::{AcceptAll, FnFilter, SessionFilter};
