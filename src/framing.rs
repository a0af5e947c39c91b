//! Length-prefixed operation frames.
//!
//! One frame carries one serialized [`Operation`]: a little-endian u32 length
//! followed by the JSON body. The helpers are generic over the tokio byte
//! stream traits so the same code serves iroh QUIC streams and the in-memory
//! pipes used by tests.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Operation;

/// Upper bound on a frame body; anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        bail!("frame of {} bytes exceeds the frame limit", data.len());
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a cleanly closed stream.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        bail!("peer announced a {len}-byte frame, over the frame limit");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Serialize and frame one operation.
pub async fn write_operation<W>(stream: &mut W, operation: &Operation) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = operation.encode()?;
    write_frame(stream, &bytes).await
}

/// Read and deserialize one operation; `None` on a cleanly closed stream.
pub async fn read_operation<R>(stream: &mut R) -> Result<Option<Operation>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(stream).await? {
        Some(bytes) => Ok(Some(Operation::decode(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeInfo;
    use crate::protocol::Notify;

    #[tokio::test]
    async fn operations_survive_the_frame_boundary() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let sent = Operation::Notify(Notify {
            origin: NodeInfo {
                id: 42,
                addr: "node-42".into(),
            },
        });
        write_operation(&mut client, &sent).await.unwrap();
        drop(client);

        let received = read_operation(&mut server).await.unwrap().unwrap();
        assert_eq!(received.kind(), "notify");
        assert_eq!(received.origin().id, 42);

        // The closed stream reads as end-of-frames, not as an error.
        assert!(read_operation(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            // Announce an absurd length without sending a body.
            client
                .write_u32_le((MAX_FRAME_SIZE + 1) as u32)
                .await
                .unwrap();
            client
        });

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("frame limit"));
        drop(writer.await.unwrap());
    }
}
