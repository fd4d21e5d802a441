use std::time::Duration;
use tokio::net::TcpStream;

/// Probes whether something is accepting TCP connections at `host:port`.
/// Connection refused, unreachable and timeout all count as closed.
pub async fn tcp_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
