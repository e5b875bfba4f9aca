//! Socket and packet helpers shared by the TCP-based probes.

use crate::error::ProbeError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

/// Open a TCP connection with a deadline.
pub async fn connect(ip: &str, port: u16, limit: Duration) -> Result<TcpStream, ProbeError> {
    match timeout(limit, TcpStream::connect((ip, port))).await {
        Err(_) => Err(ProbeError::timeout("connecting", limit)),
        Ok(Err(e)) => Err(ProbeError::from_connect(e)),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Read until EOF, `cap` bytes, `done(buf)` returns true, or `limit` elapses.
///
/// Running out of time after some data arrived returns that data; timing out
/// with nothing read is an error.
pub async fn read_capped<R, F>(
    reader: &mut R,
    cap: usize,
    limit: Duration,
    done: F,
) -> Result<Vec<u8>, ProbeError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> bool,
{
    let deadline = Instant::now() + limit;
    let mut buf = Vec::with_capacity(cap.min(4096));
    let mut chunk = [0u8; 1024];

    while buf.len() < cap {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, reader.read(&mut chunk)).await {
            Err(_) => break,
            Ok(Ok(0)) => return Ok(buf),
            Ok(Ok(n)) => {
                let take = n.min(cap - buf.len());
                buf.extend_from_slice(&chunk[..take]);
                if done(&buf) {
                    return Ok(buf);
                }
            }
            Ok(Err(e)) => {
                if buf.is_empty() {
                    return Err(e.into());
                }
                return Ok(buf);
            }
        }
    }

    if buf.is_empty() {
        return Err(ProbeError::timeout("waiting for response", limit));
    }
    Ok(buf)
}

/// Write `request` and collect the reply on an already open stream.
pub async fn send_and_read<S>(
    stream: &mut S,
    request: &[u8],
    cap: usize,
    limit: Duration,
) -> Result<Vec<u8>, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(limit, stream.write_all(request)).await {
        Err(_) => return Err(ProbeError::timeout("sending request", limit)),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(())) => {}
    }
    // Protocols probed here answer with a single PDU; stop after the first read burst.
    read_capped(stream, cap, limit, |buf| !buf.is_empty()).await
}

/// Connect, send one request and read one reply.
pub async fn exchange(
    ip: &str,
    port: u16,
    request: &[u8],
    cap: usize,
    limit: Duration,
) -> Result<Vec<u8>, ProbeError> {
    let mut stream = connect(ip, port, limit).await?;
    let reply = send_and_read(&mut stream, request, cap, limit).await?;
    if reply.is_empty() {
        return Err(ProbeError::NoResponse);
    }
    Ok(reply)
}

/// SMB dialect family recognised in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmbDialect {
    Smb1,
    Smb2,
}

const SMB1_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];
const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// Dialects offered in the negotiate request. The SMB 2 strings make hosts
/// with SMB 1 disabled still answer.
const SMB_DIALECTS: &[&str] = &["NT LM 0.12", "SMB 2.002", "SMB 2.???"];

/// SMB1 `NEGOTIATE` request in a NetBIOS session frame, valid on 139 and 445.
pub fn smb_negotiate_request() -> Vec<u8> {
    let mut smb = Vec::with_capacity(96);
    smb.extend_from_slice(&SMB1_MAGIC);
    smb.push(0x72); // SMB_COM_NEGOTIATE
    smb.extend_from_slice(&[0x00; 4]); // status
    smb.push(0x18); // flags: case-insensitive, canonicalized paths
    smb.extend_from_slice(&[0x01, 0x28]); // flags2: long names, NT status, extended security off
    smb.extend_from_slice(&[0x00; 2]); // PID high
    smb.extend_from_slice(&[0x00; 8]); // security features
    smb.extend_from_slice(&[0x00; 2]); // reserved
    smb.extend_from_slice(&[0xFF, 0xFF]); // TID
    smb.extend_from_slice(&[0xFE, 0xCA]); // PID
    smb.extend_from_slice(&[0x00; 2]); // UID
    smb.extend_from_slice(&[0x00; 2]); // MID
    smb.push(0x00); // word count

    let mut dialects = Vec::new();
    for name in SMB_DIALECTS {
        dialects.push(0x02);
        dialects.extend_from_slice(name.as_bytes());
        dialects.push(0x00);
    }
    smb.extend_from_slice(&(dialects.len() as u16).to_le_bytes());
    smb.extend_from_slice(&dialects);

    let len = smb.len() as u32;
    let mut frame = Vec::with_capacity(4 + smb.len());
    frame.push(0x00); // session message
    frame.extend_from_slice(&len.to_be_bytes()[1..]);
    frame.extend_from_slice(&smb);
    frame
}

/// Look for an SMB1 or SMB2 header signature anywhere in a reply.
pub fn smb_signature(reply: &[u8]) -> Option<SmbDialect> {
    reply.windows(4).find_map(|w| {
        if w == SMB1_MAGIC {
            Some(SmbDialect::Smb1)
        } else if w == SMB2_MAGIC {
            Some(SmbDialect::Smb2)
        } else {
            None
        }
    })
}

/// Space-separated hex of at most `max_bytes`, with `...` when truncated.
pub fn hex_preview(bytes: &[u8], max_bytes: usize) -> String {
    let shown: Vec<String> = bytes
        .iter()
        .take(max_bytes)
        .map(|b| format!("{:02X}", b))
        .collect();
    let mut text = shown.join(" ");
    if bytes.len() > max_bytes {
        text.push_str(" ...");
    }
    text
}

/// Collapse every whitespace run (including CR/LF) to one space and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_smb_negotiate_frame_length() {
        let frame = smb_negotiate_request();
        assert_eq!(frame[0], 0x00);
        let declared = u32::from_be_bytes([0, frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);
        assert_eq!(&frame[4..8], &SMB1_MAGIC);
        assert_eq!(frame[8], 0x72);
        assert!(frame.windows(10).any(|w| w == b"NT LM 0.12"));
    }

    #[test]
    fn test_smb_signature() {
        assert_eq!(smb_signature(&[0, 0, 0, 0x20, 0xFF, b'S', b'M', b'B', 0x72]), Some(SmbDialect::Smb1));
        assert_eq!(smb_signature(&[0, 0, 0, 0x40, 0xFE, b'S', b'M', b'B']), Some(SmbDialect::Smb2));
        assert_eq!(smb_signature(b"HTTP/1.1 400"), None);
        assert_eq!(smb_signature(&[]), None);
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0x05, 0x00, 0x0C], 8), "05 00 0C");
        assert_eq!(hex_preview(&[1, 2, 3, 4], 2), "01 02 ...");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  SSH-2.0-OpenSSH\r\n\tready  "), "SSH-2.0-OpenSSH ready");
    }

    #[tokio::test]
    async fn test_read_capped_stops_at_cap() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[7u8; 40]).await.unwrap();
        let buf = read_capped(&mut client, 16, Duration::from_secs(1), |_| false)
            .await
            .unwrap();
        assert_eq!(buf.len(), 16);
    }

    #[tokio::test]
    async fn test_read_capped_times_out_when_silent() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = read_capped(&mut client, 16, Duration::from_millis(50), |_| false)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
        });

        let reply = exchange("127.0.0.1", port, b"ping", 1024, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect("127.0.0.1", port, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionRefused));
    }
}
