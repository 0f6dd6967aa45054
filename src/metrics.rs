//! Prometheus counters for data connections, transfers and logins.

use crate::server::datachan::error::DataChanErrorKind;
use crate::server::reply::{Reply, ReplyCode};

use lazy_static::*;
use prometheus::{IntCounter, IntCounterVec, opts, register_int_counter, register_int_counter_vec};

lazy_static! {
    static ref FTP_AUTH_FAILURES: IntCounter = register_int_counter!(opts!("ftp_auth_failures", "Total number of authentication failures.")).unwrap();
    static ref FTP_SESSIONS: IntCounter = register_int_counter!(opts!("ftp_sessions_total", "Total number of FTP sessions.")).unwrap();
    static ref FTP_PASSIVE_PORTS_EXHAUSTED: IntCounter =
        register_int_counter!(opts!("ftp_passive_ports_exhausted", "Total number of PASV requests that found no free port.")).unwrap();
    static ref FTP_TRANSFER_BYTES: IntCounterVec =
        register_int_counter_vec!("ftp_transfer_bytes", "Total number of bytes transferred over data connections.", &["direction"]).unwrap();
    static ref FTP_TRANSFERS: IntCounterVec =
        register_int_counter_vec!("ftp_transfers_total", "Total number of completed data transfers.", &["direction"]).unwrap();
    static ref FTP_DATACHAN_ERRORS: IntCounterVec =
        register_int_counter_vec!("ftp_datachan_error_total", "Total number of data connection errors.", &["code"]).unwrap();
    static ref FTP_REPLY_TOTAL: IntCounterVec =
        register_int_counter_vec!("ftp_reply_total", "Total number of reply codes server sent to clients.", &["range"]).unwrap();
}

pub(crate) fn inc_login_failures() {
    FTP_AUTH_FAILURES.inc();
}

pub(crate) fn inc_session() {
    FTP_SESSIONS.inc();
}

pub(crate) fn add_transfer_metric(direction: &'static str, bytes: u64) {
    FTP_TRANSFERS.with_label_values(&[direction]).inc();
    FTP_TRANSFER_BYTES.with_label_values(&[direction]).inc_by(bytes);
}

/// Add a metric for a data connection error.
pub fn add_error_metric(kind: DataChanErrorKind) {
    if kind == DataChanErrorKind::PortsExhausted {
        FTP_PASSIVE_PORTS_EXHAUSTED.inc();
    }
    let kind_str = kind.to_string();
    let label = kind_str.split_whitespace().next().unwrap_or("unknown");
    FTP_DATACHAN_ERRORS.with_label_values(&[label]).inc();
}

/// Add a metric for a reply.
pub fn add_reply_metric(reply: &Reply) {
    match *reply {
        Reply::None => {}
        Reply::CodeAndMsg { code, .. } => add_replycode_metric(code),
        Reply::MultiLine { code, .. } => add_replycode_metric(code),
    }
}

fn add_replycode_metric(code: ReplyCode) {
    let range = format!("{}xx", code as u32 / 100 % 10);
    FTP_REPLY_TOTAL.with_label_values(&[range.as_str()]).inc();
}
