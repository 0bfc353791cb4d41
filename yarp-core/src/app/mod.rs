//! Per-protocol connection handling.

pub mod http;
pub mod https;
pub mod pipe;
pub mod proxy_host;
pub mod proxy_sni;
pub mod rewind;
pub mod route;
pub mod tcp;
pub mod udp;

use thiserror::Error;

/// Failure to identify a target host from the opening bytes of a connection.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("i/o error while sniffing: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out reading request preamble")]
    Timeout,

    #[error("request header too large")]
    HeaderTooLarge,

    #[error("no host header in request")]
    NoHost,

    #[error("not a tls handshake record (first byte {0:#04x})")]
    NotTlsHandshake(u8),

    #[error("unreasonable tls record length {0}")]
    BadRecordLength(usize),

    #[error("client hello carries no server name")]
    NoServerName,
}

/// Per-connection failure inside a listener task. Handled locally: logged,
/// and the connection is dropped.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Sniff(#[from] SniffError),

    #[error(transparent)]
    Route(#[from] route::RouteError),

    #[error("failed to dial target {target}: {source}")]
    Dial {
        target: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
