//! Utilities for testing code that uses nodes: they are used for testing this crate itself, but
//!  they are also exported for application testing.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

pub mod node;


/// Binds `n` sockets to ephemeral ports on localhost
pub async fn bind_localhost(n: usize) -> anyhow::Result<Vec<UdpSocket>> {
    let mut result = Vec::with_capacity(n);
    for _ in 0..n {
        result.push(UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?);
    }
    Ok(result)
}
