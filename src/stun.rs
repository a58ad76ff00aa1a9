/**
 * stun.rs
 *
 * NAT Probe: a standard STUN Binding exchange (RFC 5389 subset) run
 * over the endpoint's own socket so the observed reflexive mapping is
 * the exact one the tunnel will use.
 */

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;

/// Diagnostic-only NAT classification. The punch algorithm never
/// branches on this; see SPEC_FULL.md §4.1 for why a full
/// full-cone/restricted/symmetric taxonomy is not attempted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatClass {
    OpenInternet,
    BehindNat,
}

#[derive(Debug, Clone)]
pub struct ReflexiveAddr {
    pub nat_class: NatClass,
    pub public_ip: IpAddr,
    pub public_port: u16,
}

/// Build a STUN binding request with a random transaction id.
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);
    request
}

fn parse_mapped_address(data: &[u8]) -> Result<(IpAddr, u16)> {
    if data.len() < 8 {
        return Err(anyhow!("MAPPED-ADDRESS too short"));
    }
    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = match family {
        0x01 => IpAddr::from([data[4], data[5], data[6], data[7]]),
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("invalid IPv6 address length"));
            }
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&data[4..20]);
            IpAddr::from(bytes)
        }
        other => return Err(anyhow!("unknown address family: {}", other)),
    };
    Ok((ip, port))
}

fn parse_xor_mapped_address(data: &[u8], transaction_id: &[u8; 12]) -> Result<(IpAddr, u16)> {
    if data.len() < 8 {
        return Err(anyhow!("XOR-MAPPED-ADDRESS too short"));
    }
    let family = data[1];
    let xor_port = u16::from_be_bytes([data[2], data[3]]);
    let port = xor_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        0x01 => {
            let xor_addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            IpAddr::from((xor_addr ^ STUN_MAGIC_COOKIE).to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("invalid IPv6 address length"));
            }
            let mut key = [0u8; 16];
            key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            key[4..16].copy_from_slice(transaction_id);
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&data[4..20]);
            for i in 0..16 {
                bytes[i] ^= key[i];
            }
            IpAddr::from(bytes)
        }
        other => return Err(anyhow!("unknown address family: {}", other)),
    };
    Ok((ip, port))
}

/// Parse a STUN binding response, returning the reflexive (ip, port).
fn parse_binding_response(data: &[u8], expected_transaction_id: &[u8; 12]) -> Result<(IpAddr, u16)> {
    if data.len() < 20 {
        return Err(anyhow!("STUN response too short"));
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(anyhow!("invalid STUN response type: 0x{:04x}", msg_type));
    }
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(anyhow!("invalid magic cookie"));
    }
    if &data[8..20] != expected_transaction_id {
        return Err(anyhow!("transaction id mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(anyhow!("STUN response truncated"));
    }

    let mut offset = 20;
    while offset + 4 <= 20 + msg_len && offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > data.len() {
            break;
        }
        let attr_data = &data[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_xor_mapped_address(attr_data, expected_transaction_id),
            ATTR_MAPPED_ADDRESS => return parse_mapped_address(attr_data),
            _ => {}
        }
        offset += (attr_len + 3) & !3;
    }

    Err(anyhow!("no address attribute found in STUN response"))
}

/// Build a bare STUN binding request suitable for a keepalive ping —
/// the response is never parsed, only its arrival keeps the NAT
/// mapping open.
pub fn keepalive_request() -> Vec<u8> {
    let transaction_id: [u8; 12] = rand::random();
    build_binding_request(&transaction_id)
}

/// Run a STUN Binding exchange over `socket` against `stun_server`,
/// retrying up to `MAX_RETRIES` times within a bounded window.
pub async fn probe(socket: &UdpSocket, stun_server: SocketAddr) -> Result<ReflexiveAddr> {
    let local_addr = socket.local_addr().context("local socket address unavailable")?;

    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);

        if let Err(e) = socket.send_to(&request, stun_server).await {
            last_err = Some(anyhow!("STUN send failed: {e}"));
            continue;
        }

        let mut buf = [0u8; 512];
        match timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _from))) => match parse_binding_response(&buf[..len], &transaction_id) {
                Ok((public_ip, public_port)) => {
                    let nat_class = if local_addr.ip() == public_ip && local_addr.port() == public_port {
                        NatClass::OpenInternet
                    } else {
                        NatClass::BehindNat
                    };
                    return Ok(ReflexiveAddr {
                        nat_class,
                        public_ip,
                        public_port,
                    });
                }
                Err(e) => last_err = Some(e),
            },
            Ok(Err(e)) => last_err = Some(anyhow!("STUN recv failed: {e}")),
            Err(_) => last_err = Some(anyhow!("STUN request timed out (attempt {})", attempt + 1)),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("STUN_UNREACHABLE"))).context("STUN_UNREACHABLE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_correct_header() {
        let tid = [7u8; 12];
        let req = build_binding_request(&tid);
        assert_eq!(req.len(), 20);
        assert_eq!(u16::from_be_bytes([req[0], req[1]]), STUN_BINDING_REQUEST);
        assert_eq!(u32::from_be_bytes([req[4], req[5], req[6], req[7]]), STUN_MAGIC_COOKIE);
        assert_eq!(&req[8..20], &tid);
    }

    #[test]
    fn parses_xor_mapped_address_response() {
        let tid = [1u8; 12];
        let ip = [203, 0, 113, 5];
        let port: u16 = 54321;

        let xor_port = port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let xor_ip = u32::from_be_bytes(ip) ^ STUN_MAGIC_COOKIE;

        let mut attr = Vec::new();
        attr.push(0x00);
        attr.push(0x01); // family IPv4
        attr.extend_from_slice(&xor_port.to_be_bytes());
        attr.extend_from_slice(&xor_ip.to_be_bytes());

        let mut msg = Vec::new();
        msg.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((attr.len() + 4) as u16).to_be_bytes());
        msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&tid);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        msg.extend_from_slice(&attr);

        let (parsed_ip, parsed_port) = parse_binding_response(&msg, &tid).unwrap();
        assert_eq!(parsed_ip, IpAddr::from(ip));
        assert_eq!(parsed_port, port);
    }

    #[test]
    fn rejects_transaction_id_mismatch() {
        let tid = [2u8; 12];
        let wrong_tid = [3u8; 12];
        let mut msg = Vec::new();
        msg.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&wrong_tid);

        assert!(parse_binding_response(&msg, &tid).is_err());
    }
}
