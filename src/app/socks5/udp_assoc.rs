use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::app::error::ProxyError;

use super::addr::SocksAddr;

const VERSION: u8 = 0x05;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const REP_SUCCEEDED: u8 = 0x00;

/// Issues UDP-ASSOCIATE on an already-greeted control connection and
/// returns the relay endpoint the backend wants datagrams sent to (spec
/// §4.7 step 2). The DST.ADDR/DST.PORT in the request is always
/// `0.0.0.0:0` per RFC 1928 §6 — the original does the same in
/// `socks5_udp_associate` since the client doesn't yet know which local
/// address it will send from.
pub(crate) async fn udp_associate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<SocketAddr, ProxyError> {
    let mut req = vec![VERSION, CMD_UDP_ASSOCIATE, 0x00];
    SocksAddr::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .write_to(&mut req)
        .map_err(ProxyError::SocketError)?;
    req.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&req).await.map_err(ProxyError::SocketError)?;

    let mut hdr = [0u8; 4];
    stream
        .read_exact(&mut hdr)
        .await
        .map_err(ProxyError::SocketError)?;
    let [ver, rep, _rsv, atyp] = hdr;
    if ver != VERSION {
        return Err(ProxyError::SocksHandshake(format!(
            "unexpected version {ver:#x} in UDP ASSOCIATE reply"
        )));
    }
    if rep != REP_SUCCEEDED {
        return Err(ProxyError::SocksHandshake(format!(
            "UDP ASSOCIATE refused, rep={rep:#x}"
        )));
    }

    let mut prefix = vec![atyp];
    let bnd_addr = match atyp {
        0x01 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.map_err(ProxyError::SocketError)?;
            prefix.extend_from_slice(&buf);
            SocksAddr::read_from(&mut prefix.as_slice()).map_err(ProxyError::SocketError)?
        }
        0x04 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.map_err(ProxyError::SocketError)?;
            prefix.extend_from_slice(&buf);
            SocksAddr::read_from(&mut prefix.as_slice()).map_err(ProxyError::SocketError)?
        }
        0x03 => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.map_err(ProxyError::SocketError)?;
            prefix.push(len_buf[0]);
            let mut name = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut name).await.map_err(ProxyError::SocketError)?;
            prefix.extend_from_slice(&name);
            SocksAddr::read_from(&mut prefix.as_slice()).map_err(ProxyError::SocketError)?
        }
        other => {
            return Err(ProxyError::SocksHandshake(format!(
                "unknown ATYP {other:#x} in UDP ASSOCIATE reply"
            )))
        }
    };
    let mut port_buf = [0u8; 2];
    stream
        .read_exact(&mut port_buf)
        .await
        .map_err(ProxyError::SocketError)?;
    let port = u16::from_be_bytes(port_buf);

    match bnd_addr {
        SocksAddr::Ip(ip) => Ok(SocketAddr::new(ip, port)),
        // A relay address given as a name isn't actionable as a UDP peer;
        // the original never sees this in practice since every tested
        // backend replies with an IP literal here.
        SocksAddr::Name(name) => Err(ProxyError::SocksHandshake(format!(
            "UDP ASSOCIATE returned a domain relay address ({name}), expected an IP literal"
        ))),
    }
}
