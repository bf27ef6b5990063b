//! Raw byte relay for pass-through connections.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUFFER_SIZE: usize = 8192;

/// Proxy data bidirectionally between two streams.
///
/// EOF on one side shuts down the write half of the other; the relay returns
/// once both directions have finished. Returns (bytes_a_to_b, bytes_b_to_a).
pub async fn proxy_bidirectional<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_result, b_result) = tokio::join!(
        copy_and_close(&mut a_read, &mut b_write),
        copy_and_close(&mut b_read, &mut a_write),
    );

    match (a_result, b_result) {
        (Ok(a_to_b), Ok(b_to_a)) => Ok((a_to_b, b_to_a)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

async fn copy_and_close<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_half_closes() {
        let (client, proxy_client_side) = duplex(1024);
        let (proxy_server_side, server) = duplex(1024);

        let relay = tokio::spawn(proxy_bidirectional(proxy_client_side, proxy_server_side));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"request").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut received = Vec::new();
        server_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // The other direction is still open after the client half-closed.
        server_write.write_all(b"response").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_read.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!(up, 7);
        assert_eq!(down, 8);
    }
}
