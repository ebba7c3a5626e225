//! `Content-Length` framing over byte streams.

use super::LspError;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a server
const MAX_FRAME: usize = 64 * 1024 * 1024;

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, LspError> {
    let body = serde_json::to_vec(message).map_err(|e| LspError::Protocol(e.to_string()))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), LspError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>, LspError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            if saw_header {
                return Err(LspError::Protocol("stream ended inside frame header".to_string()));
            }
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;

        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| LspError::Protocol(format!("bad Content-Length: {}", value.trim())))?;
                content_length = Some(length);
            }
        }
    }

    let length = content_length.ok_or_else(|| LspError::Protocol("missing Content-Length".to_string()))?;
    if length > MAX_FRAME {
        return Err(LspError::Protocol(format!("frame of {} bytes is too large", length)));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| LspError::Protocol(format!("invalid JSON frame: {}", e)))
}
