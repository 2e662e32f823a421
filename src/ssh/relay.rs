//! Bidirectional byte relay between a local socket and a forwarded channel.
//!
//! Each direction is a reader and a writer joined by a bounded queue. The
//! reader stalls once the queue is full, so a slow side pushes back on the
//! fast one instead of growing a buffer. When either direction finishes
//! (EOF or error) the whole session ends and both ends are dropped.

use futures::future::{self, Either};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Largest chunk moved through the queue in one message
pub const RELAY_CHUNK_SIZE: usize = 32 * 1024;

/// Chunks in flight per direction before the reader stalls
pub const RELAY_QUEUE_DEPTH: usize = 8;

/// Bytes moved by a finished session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub local_to_remote: u64,
    pub remote_to_local: u64,
}

/// One local socket paired with one forwarded channel.
pub struct RelaySession<L, R> {
    id: Uuid,
    local: L,
    remote: R,
}

impl<L, R> RelaySession<L, R>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `id` is the session's key in the listener's registry and its log tag.
    pub fn new(id: Uuid, local: L, remote: R) -> Self {
        Self {
            id,
            local,
            remote,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relay until either side closes or fails.
    ///
    /// The direction that hit EOF first is fully flushed and its write side
    /// closed before the session tears down.
    pub async fn run(self) -> io::Result<RelayStats> {
        let id = self.id;
        let (local_read, local_write) = self.local.split();
        let (remote_read, remote_write) = self.remote.split();

        let upstream_bytes = AtomicU64::new(0);
        let downstream_bytes = AtomicU64::new(0);

        let upstream = pump(local_read, remote_write, &upstream_bytes);
        let downstream = pump(remote_read, local_write, &downstream_bytes);
        futures::pin_mut!(upstream, downstream);

        let result = match future::select(upstream, downstream).await {
            Either::Left((result, _)) => {
                tracing::debug!("Relay {} local side closed", id);
                result
            }
            Either::Right((result, _)) => {
                tracing::debug!("Relay {} remote side closed", id);
                result
            }
        };

        let stats = RelayStats {
            local_to_remote: upstream_bytes.load(Ordering::Relaxed),
            remote_to_local: downstream_bytes.load(Ordering::Relaxed),
        };
        result.map(|()| stats)
    }
}

/// Copy `reader` into `writer` through a bounded queue, then close `writer`.
async fn pump<Rd, Wr>(mut reader: Rd, mut writer: Wr, counter: &AtomicU64) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let (tx, rx) = async_channel::bounded::<Vec<u8>>(RELAY_QUEUE_DEPTH);

    let read_side = async move {
        let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if tx.send(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
        // tx drops here, letting the writer drain and finish
        Ok::<(), io::Error>(())
    };

    let write_side = async move {
        while let Ok(chunk) = rx.recv().await {
            writer.write_all(&chunk).await?;
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        writer.flush().await?;
        writer.close().await
    };

    futures::try_join!(read_side, write_side)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::net::{TcpListener, TcpStream};
    use std::time::Duration;

    /// Connected loopback pair (client, server)
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            futures::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_relay_forwards_both_directions() {
        smol::block_on(async {
            let (mut client, local) = socket_pair().await;
            let (remote, mut server) = socket_pair().await;

            let session = smol::spawn(RelaySession::new(Uuid::new_v4(), local, remote).run());

            client.write_all(b"PING").await.unwrap();
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING");

            server.write_all(b"PONG").await.unwrap();
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PONG");

            drop(client);
            let stats = session.await.unwrap();
            assert_eq!(stats.local_to_remote, 4);
            assert_eq!(stats.remote_to_local, 4);
        });
    }

    #[test]
    fn test_half_close_flushes_then_tears_down() {
        smol::block_on(async {
            let (mut client, local) = socket_pair().await;
            let (remote, mut server) = socket_pair().await;

            let session = smol::spawn(RelaySession::new(Uuid::new_v4(), local, remote).run());

            client.write_all(b"last words").await.unwrap();
            client.close().await.unwrap();

            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"last words");

            session.await.unwrap();

            // The client's read side is closed too
            let mut rest = Vec::new();
            let read = smol::future::or(
                async { client.read_to_end(&mut rest).await.map(|_| true) },
                async {
                    smol::Timer::after(Duration::from_secs(5)).await;
                    Ok(false)
                },
            )
            .await;
            assert!(read.unwrap_or(true), "client never saw the relay close");
        });
    }
}
