//! HTTP Host-header sniffer.
//!
//! Reads just enough of a fresh connection to learn which host the client is
//! asking for, then puts every byte back so the backend sees the request
//! verbatim. For `CONNECT` requests the target is the request line itself;
//! everything else is routed by the first `Host:` header.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use super::rewind::RewindStream;
use super::SniffError;

/// Read deadline for the whole preamble.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on the preamble; anything larger is rejected.
const MAX_PREAMBLE: usize = 128 * 1024;

/// Extracts the target host from the opening bytes of `conn`. The collected
/// bytes are un-read in every case, success or failure, so the connection
/// can still be replayed or torn down cleanly by the caller.
pub async fn sniff_host<S>(conn: &mut RewindStream<S>) -> Result<String, SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut preamble = Vec::new();
    let outcome = match timeout(SNIFF_TIMEOUT, read_preamble(conn, &mut preamble)).await {
        Ok(Ok(())) => parse_host(&preamble).ok_or(SniffError::NoHost),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SniffError::Timeout),
    };
    conn.unread(&preamble);
    outcome
}

/// Reads until the blank line ending the header block (`CRLF CRLF`) or EOF.
async fn read_preamble<S>(
    conn: &mut RewindStream<S>,
    collected: &mut Vec<u8>,
) -> Result<(), SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 2048];
    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        // The terminator may straddle the chunk boundary.
        let scan_from = collected.len().saturating_sub(3);
        collected.extend_from_slice(&chunk[..n]);
        if collected.len() > MAX_PREAMBLE {
            return Err(SniffError::HeaderTooLarge);
        }
        if contains_header_end(&collected[scan_from..]) {
            return Ok(());
        }
    }
}

fn contains_header_end(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

fn parse_host(preamble: &[u8]) -> Option<String> {
    let line_end = preamble.windows(2).position(|w| w == b"\r\n")?;
    let request_line = &preamble[..line_end];

    let mut tokens = request_line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|t| !t.is_empty());
    let method = tokens.next()?;
    if method.eq_ignore_ascii_case(b"CONNECT") {
        // CONNECT carries the target in host:port form on the request line.
        let host = tokens.next()?;
        return host_string(host);
    }

    let mut rest = &preamble[line_end + 2..];
    while !rest.is_empty() {
        let end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(rest.len());
        let line = &rest[..end];
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case(b"host:") {
            return host_string(trim_spaces(&line[5..]));
        }
        if end == rest.len() {
            break;
        }
        rest = &rest[end + 2..];
    }
    None
}

fn trim_spaces(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn host_string(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn extracts_host_and_replays_exact_bytes() {
        let (mut near, far) = duplex(1024);
        let payload = b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n";
        near.write_all(payload).await.unwrap();
        drop(near);

        let mut conn = RewindStream::new(far);
        let host = sniff_host(&mut conn).await.unwrap();
        assert_eq!(host, "a.example");

        let mut replayed = Vec::new();
        conn.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, payload);
    }

    #[tokio::test]
    async fn connect_target_is_taken_from_the_request_line() {
        let (mut near, far) = duplex(1024);
        let payload = b"CONNECT example.org:443 HTTP/1.1\r\n\r\n";
        near.write_all(payload).await.unwrap();
        drop(near);

        let mut conn = RewindStream::new(far);
        let host = sniff_host(&mut conn).await.unwrap();
        assert_eq!(host, "example.org:443");

        let mut replayed = Vec::new();
        conn.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, payload);
    }

    #[tokio::test]
    async fn host_header_match_is_case_insensitive() {
        let (mut near, far) = duplex(1024);
        near.write_all(b"GET / HTTP/1.1\r\nhOsT:  b.example \r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();
        drop(near);

        let mut conn = RewindStream::new(far);
        assert_eq!(sniff_host(&mut conn).await.unwrap(), "b.example");
    }

    #[tokio::test]
    async fn missing_host_fails_after_unreading() {
        let (mut near, far) = duplex(1024);
        let payload = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        near.write_all(payload).await.unwrap();
        drop(near);

        let mut conn = RewindStream::new(far);
        assert!(matches!(
            sniff_host(&mut conn).await,
            Err(SniffError::NoHost)
        ));

        // The preamble must have been put back even though sniffing failed.
        let mut replayed = Vec::new();
        conn.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, payload);
    }

    #[tokio::test]
    async fn oversized_preamble_is_rejected() {
        let (mut near, far) = duplex(4096);
        let writer = tokio::spawn(async move {
            let chunk = [b'a'; 4096];
            for _ in 0..33 {
                if near.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut conn = RewindStream::new(far);
        assert!(matches!(
            sniff_host(&mut conn).await,
            Err(SniffError::HeaderTooLarge)
        ));
        writer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let (_near, far) = duplex(1024);
        let mut conn = RewindStream::new(far);
        assert!(matches!(
            sniff_host(&mut conn).await,
            Err(SniffError::Timeout)
        ));
    }
}
