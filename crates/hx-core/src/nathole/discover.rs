//! Public mapping discovery over STUN (RFC 5389 Binding)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use tokio::net::UdpSocket;

use crate::error::NatError;

/// How long to wait for each Binding response
pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(3);

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const STUN_HEADER_SIZE: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Addresses carried by a Binding success response
#[derive(Debug, Default, PartialEq, Eq)]
struct BindingResponse {
    mapped: Option<SocketAddr>,
    changed: Option<SocketAddr>,
}

/// Observe this host's public mapping from each STUN server.
///
/// A single UDP socket is used for every request so all observations
/// describe the same local port. When a server advertises an alternate
/// address (CHANGED-ADDRESS or OTHER-ADDRESS) it is queried as well, which
/// is what exposes destination-dependent mappings. Returns the observed
/// `ip:port` strings and the local address of the socket.
pub async fn discover(
    stun_servers: &[String],
    local_addr: Option<&str>,
) -> Result<(Vec<String>, SocketAddr), NatError> {
    if stun_servers.is_empty() {
        return Err(NatError::Stun("no STUN server configured".to_string()));
    }

    let socket = UdpSocket::bind(local_addr.unwrap_or("0.0.0.0:0")).await?;
    let local = socket.local_addr()?;

    let mut observed = Vec::new();
    for server in stun_servers {
        let server_addr = match resolve(server).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Skipping STUN server {}: {}", server, e);
                continue;
            }
        };

        let response = match binding_request(&socket, server_addr).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("STUN request to {} failed: {}", server, e);
                continue;
            }
        };

        let Some(mapped) = response.mapped else {
            tracing::warn!("STUN server {} returned no mapped address", server);
            continue;
        };
        observed.push(mapped.to_string());

        if let Some(changed) = response.changed {
            match binding_request(&socket, changed).await {
                Ok(BindingResponse {
                    mapped: Some(mapped),
                    ..
                }) => observed.push(mapped.to_string()),
                Ok(_) => tracing::debug!("Alternate STUN address {} returned no mapping", changed),
                Err(e) => tracing::debug!("Alternate STUN address {} failed: {}", changed, e),
            }
        }
    }

    if observed.is_empty() {
        return Err(NatError::Stun("no STUN server answered".to_string()));
    }

    Ok((observed, local))
}

async fn resolve(server: &str) -> Result<SocketAddr, NatError> {
    tokio::net::lookup_host(server)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| NatError::Stun(format!("cannot resolve {}", server)))
}

async fn binding_request(socket: &UdpSocket, server: SocketAddr) -> Result<BindingResponse, NatError> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let request = encode_binding_request(&transaction_id);
    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 1024];
    tokio::time::timeout(DISCOVER_TIMEOUT, async {
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                continue;
            }
            match parse_binding_response(&buf[..n], &transaction_id) {
                Some(response) => return Ok(response),
                None => continue,
            }
        }
    })
    .await
    .map_err(|_| NatError::Stun(format!("timeout waiting for {}", server)))?
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(STUN_HEADER_SIZE);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);
    buf
}

/// Parse a Binding success response for `transaction_id`.
///
/// Returns `None` for anything else, including malformed packets.
fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Option<BindingResponse> {
    if data.len() < STUN_HEADER_SIZE {
        return None;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if msg_type != BINDING_SUCCESS || &data[8..20] != transaction_id {
        return None;
    }
    let body = data.get(STUN_HEADER_SIZE..STUN_HEADER_SIZE + msg_len)?;

    let mut response = BindingResponse::default();
    let mut xor_mapped = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body.get(offset + 4..offset + 4 + attr_len)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_address(value, Some(transaction_id)),
            ATTR_MAPPED_ADDRESS => response.mapped = parse_address(value, None),
            ATTR_CHANGED_ADDRESS | ATTR_OTHER_ADDRESS => {
                response.changed = response.changed.or(parse_address(value, None))
            }
            _ => {}
        }

        // Attributes are padded to 4 bytes
        offset += 4 + attr_len.div_ceil(4) * 4;
    }

    if xor_mapped.is_some() {
        response.mapped = xor_mapped;
    }
    Some(response)
}

/// Decode a (XOR-)MAPPED-ADDRESS style value. XOR decoding applies when a
/// transaction id is given.
fn parse_address(value: &[u8], xor_with: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let cookie = MAGIC_COOKIE.to_be_bytes();
    let ip = match family {
        FAMILY_IPV4 => {
            let raw: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            let mut octets = raw;
            if xor_with.is_some() {
                for (b, k) in octets.iter_mut().zip(cookie.iter()) {
                    *b ^= k;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let raw: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            let mut octets = raw;
            if let Some(tid) = xor_with {
                let key = cookie.iter().chain(tid.iter());
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TID: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn response_with(attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = BytesMut::new();
        for (attr_type, value) in attrs {
            body.put_u16(*attr_type);
            body.put_u16(value.len() as u16);
            body.put_slice(value);
            while body.len() % 4 != 0 {
                body.put_u8(0);
            }
        }
        let mut msg = BytesMut::new();
        msg.put_u16(BINDING_SUCCESS);
        msg.put_u16(body.len() as u16);
        msg.put_u32(MAGIC_COOKIE);
        msg.put_slice(&TID);
        msg.put_slice(&body);
        msg.to_vec()
    }

    fn plain_v4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut v = vec![0, FAMILY_IPV4];
        v.extend_from_slice(&port.to_be_bytes());
        v.extend_from_slice(&ip);
        v
    }

    fn xor_v4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let xport = port ^ (MAGIC_COOKIE >> 16) as u16;
        let mut v = vec![0, FAMILY_IPV4];
        v.extend_from_slice(&xport.to_be_bytes());
        for i in 0..4 {
            v.push(ip[i] ^ cookie[i]);
        }
        v
    }

    #[test]
    fn test_encode_binding_request() {
        let req = encode_binding_request(&TID);
        assert_eq!(req.len(), STUN_HEADER_SIZE);
        assert_eq!(&req[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&req[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&req[8..20], &TID);
    }

    #[test]
    fn test_xor_mapped_preferred() {
        let data = response_with(&[
            (ATTR_MAPPED_ADDRESS, plain_v4([10, 0, 0, 1], 1111)),
            (ATTR_XOR_MAPPED_ADDRESS, xor_v4([203, 0, 113, 9], 40000)),
        ]);
        let resp = parse_binding_response(&data, &TID).unwrap();
        assert_eq!(resp.mapped, Some("203.0.113.9:40000".parse().unwrap()));
        assert_eq!(resp.changed, None);
    }

    #[test]
    fn test_changed_address() {
        let data = response_with(&[
            (ATTR_MAPPED_ADDRESS, plain_v4([198, 51, 100, 2], 5000)),
            (ATTR_OTHER_ADDRESS, plain_v4([198, 51, 100, 3], 3479)),
        ]);
        let resp = parse_binding_response(&data, &TID).unwrap();
        assert_eq!(resp.mapped, Some("198.51.100.2:5000".parse().unwrap()));
        assert_eq!(resp.changed, Some("198.51.100.3:3479".parse().unwrap()));
    }

    #[test]
    fn test_wrong_transaction_ignored() {
        let data = response_with(&[(ATTR_MAPPED_ADDRESS, plain_v4([1, 1, 1, 1], 1))]);
        assert!(parse_binding_response(&data, &[0u8; 12]).is_none());
    }

    #[test]
    fn test_truncated_packet_ignored() {
        let data = response_with(&[(ATTR_MAPPED_ADDRESS, plain_v4([1, 1, 1, 1], 1))]);
        assert!(parse_binding_response(&data[..data.len() - 3], &TID).is_none());
        assert!(parse_binding_response(&data[..10], &TID).is_none());
    }

    /// Answer one Binding request with the sender's own address
    async fn spawn_stun_server() -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, STUN_HEADER_SIZE);
            let tid: [u8; 12] = buf[8..20].try_into().unwrap();

            let ip = match from.ip() {
                IpAddr::V4(ip) => ip.octets(),
                IpAddr::V6(_) => unreachable!(),
            };
            let mut body = BytesMut::new();
            let value = plain_v4(ip, from.port());
            body.put_u16(ATTR_MAPPED_ADDRESS);
            body.put_u16(value.len() as u16);
            body.put_slice(&value);

            let mut msg = BytesMut::new();
            msg.put_u16(BINDING_SUCCESS);
            msg.put_u16(body.len() as u16);
            msg.put_u32(MAGIC_COOKIE);
            msg.put_slice(&tid);
            msg.put_slice(&body);
            server.send_to(&msg, from).await.unwrap();
        });
        server_addr
    }

    #[tokio::test]
    async fn test_discover_against_local_server() {
        let server_addr = spawn_stun_server().await;

        let (addrs, local) = discover(&[server_addr.to_string()], Some("127.0.0.1:0"))
            .await
            .unwrap();
        assert_eq!(addrs, vec![local.to_string()]);
    }

    #[tokio::test]
    async fn test_unresolvable_server_skipped() {
        let server_addr = spawn_stun_server().await;
        let servers = vec!["no-port-given".to_string(), server_addr.to_string()];

        let (addrs, local) = discover(&servers, Some("127.0.0.1:0")).await.unwrap();
        assert_eq!(addrs, vec![local.to_string()]);
    }

    #[tokio::test]
    async fn test_discover_requires_servers() {
        assert!(matches!(discover(&[], None).await, Err(NatError::Stun(_))));
    }
}
