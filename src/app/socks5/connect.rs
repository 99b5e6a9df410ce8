use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::app::error::ProxyError;

use super::addr::SocksAddr;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const REP_SUCCEEDED: u8 = 0x00;

/// Issues a CONNECT request on an already-greeted stream and consumes the
/// BND.ADDR/BND.PORT reply (spec §4.2). Grounded on the original's
/// `socks5_connect_via`, including its rejection-reply drain of up to 4096
/// bytes for diagnostics, which this port surfaces as part of the error
/// instead of silently discarding.
pub(crate) async fn connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
) -> Result<(SocksAddr, u16), ProxyError> {
    let target = SocksAddr::from_host(target_host);
    let mut req = Vec::with_capacity(6 + target_host.len());
    req.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);
    target.write_to(&mut req).map_err(ProxyError::SocketError)?;
    req.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&req).await.map_err(ProxyError::SocketError)?;

    let mut hdr = [0u8; 4];
    stream
        .read_exact(&mut hdr)
        .await
        .map_err(ProxyError::SocketError)?;
    let [ver, rep, _rsv, _atyp] = hdr;
    if ver != VERSION {
        return Err(ProxyError::SocksHandshake(format!(
            "unexpected version {ver:#x} in CONNECT reply"
        )));
    }
    if rep != REP_SUCCEEDED {
        let mut extra = [0u8; 256];
        let n = stream.read(&mut extra).await.unwrap_or(0);
        return Err(ProxyError::SocksHandshake(format!(
            "CONNECT refused, rep={rep:#x} extra={:?}",
            &extra[..n]
        )));
    }

    // Put the ATYP byte back in front of the remaining reply so `SocksAddr`
    // can read the same framing it writes.
    let mut rest = vec![hdr[3]];
    let bnd_addr = read_reply_addr(stream, &mut rest).await?;
    let mut port_buf = [0u8; 2];
    stream
        .read_exact(&mut port_buf)
        .await
        .map_err(ProxyError::SocketError)?;
    Ok((bnd_addr, u16::from_be_bytes(port_buf)))
}

async fn read_reply_addr<S: AsyncRead + Unpin>(
    stream: &mut S,
    atyp_prefix: &mut Vec<u8>,
) -> Result<SocksAddr, ProxyError> {
    let tail_len = match atyp_prefix[0] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len_buf = [0u8; 1];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(ProxyError::SocketError)?;
            atyp_prefix.push(len_buf[0]);
            len_buf[0] as usize
        }
        other => {
            return Err(ProxyError::SocksHandshake(format!(
                "unknown ATYP {other:#x} in CONNECT reply"
            )))
        }
    };
    let mut tail = vec![0u8; tail_len];
    stream
        .read_exact(&mut tail)
        .await
        .map_err(ProxyError::SocketError)?;
    atyp_prefix.extend_from_slice(&tail);
    SocksAddr::read_from(&mut atyp_prefix.as_slice()).map_err(ProxyError::SocketError)
}
