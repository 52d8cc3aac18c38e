use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::crypto;
use crate::error::Error;
use crate::KEY_SIZE;

/// Connections idle longer than this trip a read error rather than hanging
/// forever. Generous on purpose: a parked relay half can legitimately sit
/// quiet for a long time before its peer shows up.
pub const FRAME_READ_DEADLINE: Duration = Duration::from_secs(3 * 60 * 60);

/// Write one frame: a four-byte little-endian length followed by the payload.
///
/// Header and payload go out in a single stream write, so frames are never
/// interleaved. Returns the total number of bytes written.
pub async fn write_frame<W>(conn: &mut W, payload: &[u8]) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(payload);

    conn.write_all(&buffer).await?;
    conn.flush().await?;
    Ok(buffer.len())
}

/// Read one frame, reassembling the header and payload across however many
/// socket reads the transport delivers them in.
///
/// End-of-stream maps to [`Error::ConnectionClosed`]; any other transport
/// failure is a read error.
pub async fn read_frame<R>(conn: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    match timeout(FRAME_READ_DEADLINE, read_frame_inner(conn)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "frame read deadline exceeded",
        ))),
    }
}

async fn read_frame_inner<R>(conn: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    conn.read_exact(&mut header).await.map_err(map_read_error)?;

    let length = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; length];
    conn.read_exact(&mut payload).await.map_err(map_read_error)?;
    Ok(payload)
}

fn map_read_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(err)
    }
}

/// Seal the payload under `key` and write it as a frame of
/// `nonce || ciphertext||tag`.
pub async fn write_encrypted_frame<W>(
    conn: &mut W,
    payload: &[u8],
    key: &[u8; KEY_SIZE],
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let sealed = crypto::seal(key, payload)?;
    write_frame(conn, &sealed).await
}

/// Read one frame and open it under `key`. Fails with an auth error if the
/// authentication tag does not verify.
pub async fn read_encrypted_frame<R>(conn: &mut R, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let sealed = read_frame(conn).await?;
    crypto::open(key, &sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let payload = b"framed bytes".to_vec();

        let written = write_frame(&mut a, &payload).await.expect("write should succeed");
        assert_eq!(written, 4 + payload.len());

        let read = read_frame(&mut b).await.expect("read should succeed");
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(16);

        write_frame(&mut a, b"").await.expect("write should succeed");
        let read = read_frame(&mut b).await.expect("read should succeed");
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn header_is_little_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, &[0xAB; 5]).await.expect("write should succeed");

        let mut raw = [0u8; 9];
        b.read_exact(&mut raw).await.expect("raw read should succeed");
        assert_eq!(&raw[..4], &[5, 0, 0, 0]);
        assert_eq!(&raw[4..], &[0xAB; 5]);
    }

    #[tokio::test]
    async fn read_reassembles_fragmented_writes() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();

        // Dribble the frame out in uneven pieces.
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        wire.extend_from_slice(&payload);

        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(13) {
                a.write_all(chunk).await.expect("chunk write should succeed");
                a.flush().await.expect("flush should succeed");
            }
            a
        });

        let read = read_frame(&mut b).await.expect("read should succeed");
        assert_eq!(read, payload);
        writer.await.expect("writer task should finish");
    }

    #[tokio::test]
    async fn closed_stream_reports_connection_closed() {
        let (a, mut b) = tokio::io::duplex(16);
        drop(a);

        assert!(matches!(read_frame(&mut b).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn truncated_frame_reports_connection_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Announce ten bytes, deliver three, then hang up.
        a.write_all(&10u32.to_le_bytes()).await.expect("header write");
        a.write_all(b"abc").await.expect("partial write");
        drop(a);

        assert!(matches!(read_frame(&mut b).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn encrypted_roundtrip() {
        let key = [9u8; KEY_SIZE];
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = b"sealed frame".to_vec();

        write_encrypted_frame(&mut a, &payload, &key)
            .await
            .expect("write should succeed");
        let read = read_encrypted_frame(&mut b, &key)
            .await
            .expect("read should succeed");
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn encrypted_frame_tamper_is_an_auth_error() {
        let key = [9u8; KEY_SIZE];
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_encrypted_frame(&mut a, b"payload", &key)
            .await
            .expect("write should succeed");

        // Flip one ciphertext byte after the length prefix on the wire.
        let sealed = read_frame(&mut b).await.expect("read should succeed");
        let mut tampered = sealed.clone();
        tampered[crate::NONCE_SIZE] ^= 0x80;

        let (mut c, mut d) = tokio::io::duplex(4096);
        write_frame(&mut c, &tampered).await.expect("write should succeed");
        assert!(matches!(
            read_encrypted_frame(&mut d, &key).await,
            Err(Error::Auth)
        ));
    }
}
