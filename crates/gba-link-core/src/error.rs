use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link port {0} is out of range (expected 0..4)")]
    InvalidPort(u8),

    #[error("link port {0} already has a session")]
    PortInUse(u8),

    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to start accept thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("link transport error: {0}")]
    Transport(#[from] io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("save state truncated: needed {needed} byte(s) at offset {offset}, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}
