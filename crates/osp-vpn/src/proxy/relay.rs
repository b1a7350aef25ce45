//! Bidirectional byte relay for one client/upstream pair.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Relay bytes until either side closes or errors, then close both
///
/// `pending` holds client bytes already read past the protocol header;
/// they reach the upstream before anything else. Each direction preserves
/// byte order; the two directions never wait on each other.
pub async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    pending: Vec<u8>,
) -> std::io::Result<()> {
    if !pending.is_empty() {
        upstream.write_all(&pending).await?;
    }

    let finished = {
        let (mut client_read, mut client_write) = client.split();
        let (mut upstream_read, mut upstream_write) = upstream.split();

        tokio::select! {
            r = tokio::io::copy(&mut client_read, &mut upstream_write) => ("client", r),
            r = tokio::io::copy(&mut upstream_read, &mut client_write) => ("upstream", r),
        }
    };

    match finished {
        (side, Ok(bytes)) => debug!("Relay closed by {} after {} bytes", side, bytes),
        (side, Err(e)) => debug!("Relay error on {} side: {}", side, e),
    }

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}
