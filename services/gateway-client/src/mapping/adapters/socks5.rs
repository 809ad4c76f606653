//! SOCKS5 adapter (RFC 1928, NoAuth-only, CONNECT-only): negotiates the
//! method, parses one request, and defers the success reply until the
//! caller has actually established the tunnel — a client retrying the
//! handshake on an early rejection is cheaper than one misled by a reply
//! that turns out not to hold.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use gw_protocol::GatewayError;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Addr(SocketAddr),
    Domain(String, u16),
}

/// Negotiate method selection and parse the CONNECT request. Does not send
/// the final reply; call [`send_success_reply`] once the tunnel is up, or
/// let the connection drop on error (the client sees it as a failed dial).
pub async fn prepare_connection<S>(stream: &mut S) -> Result<Target, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let [version, nmethods] = greeting;
    if version != VERSION {
        return Err(GatewayError::InvalidParam(format!("unsupported SOCKS version {version:#x}")));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await.ok();
        return Err(GatewayError::Forbidden("client does not offer NoAuth".into()));
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let [_, cmd, _reserved, atyp] = request;
    if cmd != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, unspecified()).await.ok();
        return Err(GatewayError::InvalidParam(format!("unsupported SOCKS command {cmd:#x}")));
    }

    let target = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = read_port(stream).await?;
            Target::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = read_port(stream).await?;
            Target::Addr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|e| GatewayError::InvalidParam(format!("domain is not valid utf-8: {e}")))?;
            let port = read_port(stream).await?;
            Target::Domain(domain, port)
        }
        other => {
            send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, unspecified()).await.ok();
            return Err(GatewayError::InvalidParam(format!("unsupported address type {other:#x}")));
        }
    };

    Ok(target)
}

/// Send the deferred success reply once the tunnel is established.
pub async fn send_success_reply<S>(stream: &mut S, bound: SocketAddr) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    send_reply(stream, REPLY_SUCCESS, bound).await
}

async fn send_reply<S>(stream: &mut S, reply_code: u8, bound: SocketAddr) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![VERSION, reply_code, 0x00];
    match bound {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_V4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_V6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_port<S>(stream: &mut S) -> Result<u16, GatewayError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn connect_to_ipv4_address_is_parsed() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        client
            .write_all(&[VERSION, CMD_CONNECT, 0x00, ATYP_V4, 127, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();

        let target = prepare_connection(&mut server).await.unwrap();
        assert_eq!(target, Target::Addr(SocketAddr::from(([127, 0, 0, 1], 8080))));

        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [VERSION, METHOD_NO_AUTH]);
    }

    #[tokio::test]
    async fn connect_to_domain_is_parsed() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        let domain = b"example.com";
        let mut req = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let target = prepare_connection(&mut server).await.unwrap();
        assert_eq!(target, Target::Domain("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn method_without_no_auth_is_rejected() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();

        let err = prepare_connection(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn bind_command_is_rejected_with_command_not_supported() {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        client
            .write_all(&[VERSION, 0x02, 0x00, ATYP_V4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = prepare_connection(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParam(_)));

        client.read_exact(&mut [0u8; 2]).await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn success_reply_encodes_bound_address() {
        let (mut client, mut server) = duplex(4096);
        send_success_reply(&mut server, SocketAddr::from(([127, 0, 0, 1], 9000)))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], VERSION);
        assert_eq!(reply[1], REPLY_SUCCESS);
        assert_eq!(reply[3], ATYP_V4);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 9000);
    }
}
