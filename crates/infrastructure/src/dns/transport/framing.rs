//! Two-byte big-endian length prefix used by DNS over TCP, TLS and QUIC.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_SIZE: usize = 65535;

pub async fn write_framed<S>(stream: &mut S, message_bytes: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if message_bytes.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("DNS message too large: {} bytes", message_bytes.len()),
        ));
    }

    // One write so the prefix and body share a segment.
    let mut frame = Vec::with_capacity(2 + message_bytes.len());
    frame.extend_from_slice(&(message_bytes.len() as u16).to_be_bytes());
    frame.extend_from_slice(message_bytes);

    stream.write_all(&frame).await?;
    stream.flush().await
}

pub async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;

    let len = u16::from_be_bytes(len_buf) as usize;
    if len < 12 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("DNS message shorter than a header: {} bytes", len),
        ));
    }

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}
