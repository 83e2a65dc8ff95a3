//! Bidirectional byte splice between a client and its target.
//!
//! Each direction runs its own copy loop. Whichever loop finishes first
//! cancels the session token, which ends the other loop as well: one side
//! closing ends the whole session. External cancellation (listener or
//! process shutdown) reaches both loops through the same token.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one spliced session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub to_target: u64,
    pub from_target: u64,
}

/// Splice `client` and `target` until either side closes, the idle timeout
/// elapses, or `session` is cancelled.
///
/// Transport errors end the session like a normal close; they are logged and
/// never returned.
pub async fn splice<C, T>(
    client: C,
    target: T,
    session: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> SpliceStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);

    let (to_target, from_target) = tokio::join!(
        pump(client_read, target_write, session, idle_timeout),
        pump(target_read, client_write, session, idle_timeout),
    );

    SpliceStats {
        to_target: settle("client->target", to_target),
        from_target: settle("target->client", from_target),
    }
}

fn settle(direction: &str, result: (u64, io::Result<()>)) -> u64 {
    let (total, outcome) = result;
    if let Err(e) = outcome {
        debug!(direction, error = %e, "Splice direction ended with error");
    }
    total
}

/// Copy from `reader` into `writer` until EOF, error, idle timeout or
/// cancellation. Always shuts the writer down and cancels `session` on exit.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    session: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];

    let outcome = loop {
        let read = tokio::select! {
            _ = session.cancelled() => break Ok(()),
            read = read_with_idle(&mut reader, &mut buf, idle_timeout) => read,
        };

        let n = match read {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };

        let written = tokio::select! {
            _ = session.cancelled() => break Ok(()),
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            break Err(e);
        }
        total += n as u64;
    };

    // Propagate the half close before tearing the session down, so bytes
    // already written are followed by a FIN rather than a reset.
    let _ = writer.shutdown().await;
    session.cancel();

    (total, outcome)
}

async fn read_with_idle<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        },
        None => reader.read(buf).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_half_close_delivers_everything_then_ends() {
        let (client, mut client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let session = CancellationToken::new();

        let splice_task = {
            let session = session.clone();
            tokio::spawn(async move { splice(client, target, &session, None).await })
        };

        let payload: Vec<u8> = (0..200u8).collect();
        client_peer.write_all(&payload).await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        target_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let stats = splice_task.await.unwrap();
        assert_eq!(stats.to_target, payload.len() as u64);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_both_directions() {
        let (client, mut client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let session = CancellationToken::new();

        let splice_task = {
            let session = session.clone();
            tokio::spawn(async move { splice(client, target, &session, None).await })
        };

        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        target_peer.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(target_peer);
        let stats = splice_task.await.unwrap();
        assert_eq!(
            stats,
            SpliceStats {
                to_target: 5,
                from_target: 6
            }
        );
    }

    #[tokio::test]
    async fn test_cancellation_ends_session() {
        let (client, _client_peer) = duplex(64);
        let (target, _target_peer) = duplex(64);
        let session = CancellationToken::new();

        let splice_task = {
            let session = session.clone();
            tokio::spawn(async move { splice(client, target, &session, None).await })
        };

        session.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), splice_task)
            .await
            .expect("splice should stop on cancel")
            .unwrap();
        assert_eq!(stats, SpliceStats::default());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (client, _client_peer) = duplex(64);
        let (target, _target_peer) = duplex(64);
        let session = CancellationToken::new();

        let stats = tokio::time::timeout(
            Duration::from_secs(2),
            splice(client, target, &session, Some(Duration::from_millis(50))),
        )
        .await
        .expect("idle session should end");
        assert_eq!(stats, SpliceStats::default());
        assert!(session.is_cancelled());
    }
}
