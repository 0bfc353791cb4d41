//! TLS SNI sniffer.
//!
//! Reads the first TLS record off a fresh connection, walks the contained
//! ClientHello for the `server_name` extension and puts the whole record
//! back for replay. Purely passive: nothing is ever written to the client
//! and no handshake state is built.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::rewind::RewindStream;
use super::SniffError;

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const CLIENT_HELLO: u8 = 0x01;

/// Extension number of `server_name` (RFC 6066).
const EXT_SERVER_NAME: u16 = 0x0000;

/// `server_name` entry type for a DNS hostname.
const NAME_TYPE_HOST: u8 = 0x00;

/// Upper bound on the record body we are willing to buffer.
const MAX_RECORD: usize = 128 * 1024;

/// Wraps `stream`, reads one handshake record, and returns the wrapper with
/// the record un-read together with the SNI hostname.
pub async fn sniff_sni<S>(stream: S) -> Result<(RewindStream<S>, String), SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut conn = RewindStream::new(stream);

    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await?;
    if header[0] != TLS_HANDSHAKE {
        return Err(SniffError::NotTlsHandshake(header[0]));
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD {
        return Err(SniffError::BadRecordLength(record_len));
    }

    let mut body = vec![0u8; record_len];
    conn.read_exact(&mut body).await?;

    let server_name = parse_client_hello(&body);

    let mut record = Vec::with_capacity(header.len() + body.len());
    record.extend_from_slice(&header);
    record.extend_from_slice(&body);
    conn.unread(&record);

    match server_name {
        Some(name) if !name.is_empty() => Ok((conn, name)),
        _ => Err(SniffError::NoServerName),
    }
}

/// Walks a ClientHello handshake message (record header already stripped)
/// and returns the first HostName entry of the `server_name` extension.
///
/// Layout: handshake type (1) + length (3) + client_version (2) +
/// random (32) + session_id (1+n) + cipher_suites (2+n) +
/// compression_methods (1+n) + extensions (2+n).
fn parse_client_hello(body: &[u8]) -> Option<String> {
    if body.first() != Some(&CLIENT_HELLO) {
        return None;
    }
    let mut pos = 4; // handshake type + 24-bit length
    pos += 2 + 32; // client_version + random

    let session_id_len = *body.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = read_u16(body, pos)? as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *body.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(body, pos)? as usize;
    pos += 2;
    let extensions_end = pos.checked_add(extensions_len)?;
    if extensions_end > body.len() {
        return None;
    }

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(body, pos)?;
        let ext_len = read_u16(body, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(&body[pos..pos + ext_len]);
        }
        pos += ext_len;
    }
    None
}

fn parse_server_name(ext: &[u8]) -> Option<String> {
    let list_len = read_u16(ext, 0)? as usize;
    let list_end = (2 + list_len).min(ext.len());
    let mut pos = 2;
    while pos + 3 <= list_end {
        let name_type = ext[pos];
        let name_len = read_u16(ext, pos + 1)? as usize;
        pos += 3;
        if pos + name_len > list_end {
            return None;
        }
        if name_type == NAME_TYPE_HOST {
            return std::str::from_utf8(&ext[pos..pos + name_len])
                .ok()
                .map(str::to_string);
        }
        pos += name_len;
    }
    None
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]))
}

/// Builds a minimal TLS 1.2 ClientHello record for the given SNI. Only used
/// to exercise the sniffers.
#[cfg(test)]
pub(crate) fn test_client_hello(server_name: &str) -> Vec<u8> {
    let host = server_name.as_bytes();

    let mut server_name_ext = Vec::new();
    server_name_ext.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    server_name_ext.push(NAME_TYPE_HOST);
    server_name_ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
    server_name_ext.extend_from_slice(host);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(server_name_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name_ext);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // client_version
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0); // empty session_id
    hello.extend_from_slice(&2u16.to_be_bytes());
    hello.extend_from_slice(&[0x13, 0x01]); // one cipher suite
    hello.push(1);
    hello.push(0x00); // null compression
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![CLIENT_HELLO];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
