//! Integration tests: common.
#![allow(dead_code, missing_docs)]

use async_trait::async_trait;
use ftp_datalink::notification::{EventMeta, TransferEvent, TransferListener};
use ftp_datalink::{DataConnectionPolicy, DataConnectionPolicyBuilder, DefaultUser, Listener, Reply, Session, decode_host_port};
use slog::Logger;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub const CLIENT: &str = "127.0.0.1:40000";
pub const SERVER: &str = "127.0.0.1:21";

pub fn logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub fn client() -> SocketAddr {
    CLIENT.parse().unwrap()
}

pub fn server() -> SocketAddr {
    SERVER.parse().unwrap()
}

/// A session from `remote` with a user logged in.
pub async fn logged_in(listener: &Listener, remote: SocketAddr) -> Session {
    let mut session = listener.new_session(remote, server()).unwrap();
    assert_eq!(code(&session.login(&DefaultUser::new("alice")).await), 230);
    session
}

pub fn policy() -> DataConnectionPolicyBuilder {
    DataConnectionPolicy::builder().passive_address("127.0.0.1").logger(logger())
}

/// A loopback port nobody listens on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn code(reply: &Reply) -> u32 {
    reply.code().map(|c| c.code()).unwrap_or(0)
}

/// The address in a 227 reply.
pub fn pasv_address(reply: &Reply) -> SocketAddr {
    let text = reply.to_string();
    let start = text.find('(').expect("no address in PASV reply");
    let end = text.find(')').expect("no address in PASV reply");
    decode_host_port(&text[start..=end]).unwrap()
}

/// Remembers every transfer event.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    pub events: Arc<Mutex<Vec<(TransferEvent, EventMeta)>>>,
}

#[async_trait]
impl TransferListener for RecordingListener {
    async fn receive_transfer_event(&self, e: TransferEvent, m: EventMeta) {
        self.events.lock().unwrap().push((e, m));
    }
}
