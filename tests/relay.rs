mod common;

use common::within;
use rand::RngExt;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use std::time::Duration;
use tunnelkeeper::ssh::RelaySession;
use uuid::Uuid;

const STREAM_LEN: usize = 10 * 1024 * 1024;

/// Connected loopback pair (client, server)
async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = futures::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

/// Random chunk sizes in `1..=max`, drawn up front so the thread-local RNG
/// never lives across an await in a spawned task.
fn chunk_sizes(count: usize, max: usize) -> Vec<usize> {
    let mut rng = rand::rng();
    (0..count).map(|_| rng.random_range(1..=max)).collect()
}

/// Write `data` in randomly sized chunks, keeping the stream open.
async fn write_chunked(mut stream: TcpStream, data: Vec<u8>) -> TcpStream {
    let mut sizes = chunk_sizes(256, 64 * 1024).into_iter().cycle();
    let mut offset = 0;
    while offset < data.len() {
        let len = sizes.next().unwrap_or(1).min(data.len() - offset);
        stream.write_all(&data[offset..offset + len]).await.unwrap();
        offset += len;
    }
    stream.flush().await.unwrap();
    stream
}

/// Read exactly `len` bytes using randomly sized reads.
async fn read_chunked(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut sizes = chunk_sizes(256, buf.len()).into_iter().cycle();
    let mut received = Vec::with_capacity(len);
    while received.len() < len {
        let want = sizes.next().unwrap_or(1).min(len - received.len());
        let n = stream.read(&mut buf[..want]).await.unwrap();
        assert!(n > 0, "stream ended after {} of {} bytes", received.len(), len);
        received.extend_from_slice(&buf[..n]);
    }
    received
}

#[test]
fn test_large_streams_keep_order_both_ways() {
    smol::block_on(async {
        let (client, local) = socket_pair().await;
        let (remote, server) = socket_pair().await;
        let id = Uuid::new_v4();
        let session = RelaySession::new(id, local, remote);
        assert_eq!(session.id(), id);
        let session = smol::spawn(session.run());

        let upstream = pattern(STREAM_LEN, 0x5a);
        let downstream = pattern(STREAM_LEN, 0xa5);

        let mut client_reader = client.clone();
        let mut server_reader = server.clone();

        let (client, _server, at_server, at_client) = futures::join!(
            smol::spawn(write_chunked(client, upstream.clone())),
            smol::spawn(write_chunked(server, downstream.clone())),
            read_chunked(&mut server_reader, STREAM_LEN),
            read_chunked(&mut client_reader, STREAM_LEN),
        );

        assert!(at_server == upstream, "upstream bytes reordered or corrupted");
        assert!(at_client == downstream, "downstream bytes reordered or corrupted");

        drop((client, client_reader));
        let stats = within(Duration::from_secs(10), session)
            .await
            .expect("relay did not finish after the client closed")
            .unwrap();
        assert_eq!(stats.local_to_remote, STREAM_LEN as u64);
    });
}

#[test]
fn test_client_close_mid_transfer_closes_remote() {
    smol::block_on(async {
        let (mut client, local) = socket_pair().await;
        let (remote, mut server) = socket_pair().await;
        let session = smol::spawn(RelaySession::new(Uuid::new_v4(), local, remote).run());

        client.write_all(&pattern(256 * 1024, 1)).await.unwrap();
        drop(client);

        let mut sink = Vec::new();
        let drained = within(Duration::from_secs(5), server.read_to_end(&mut sink)).await;
        assert!(drained.is_some(), "remote side never saw the close");
        assert!(within(Duration::from_secs(5), session).await.is_some());
    });
}

#[test]
fn test_remote_close_mid_transfer_closes_client() {
    smol::block_on(async {
        let (mut client, local) = socket_pair().await;
        let (remote, mut server) = socket_pair().await;
        let session = smol::spawn(RelaySession::new(Uuid::new_v4(), local, remote).run());

        server.write_all(&pattern(256 * 1024, 2)).await.unwrap();
        drop(server);

        let mut sink = Vec::new();
        let drained = within(Duration::from_secs(5), client.read_to_end(&mut sink)).await;
        assert!(drained.is_some(), "client never saw the close");
        assert!(within(Duration::from_secs(5), session).await.is_some());
    });
}
