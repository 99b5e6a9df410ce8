use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use tracing::debug;

use crate::app::error::ProxyError;

use super::addr::SocksAddr;

/// Wraps a payload in the SOCKSv5 UDP relay header (RFC 1928 §7): two
/// reserved bytes, a fragment byte (always 0, fragmentation isn't
/// supported), then DST.ADDR/DST.PORT and the payload. Mirrors the
/// teacher's `send_to_remote`/`send_to` framing in `socks5/session.rs` and
/// `socks5/connection.rs`, generalized to the shared [`SocksAddr`] codec.
pub(crate) fn encode_udp_packet(dst: &SocksAddr, port: u16, payload: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::with_capacity(payload.len() + 22);
    out.write_u16::<BE>(0).map_err(ProxyError::SocketError)?;
    out.write_u8(0).map_err(ProxyError::SocketError)?;
    dst.write_to(&mut out).map_err(ProxyError::SocketError)?;
    out.write_u16::<BE>(port).map_err(ProxyError::SocketError)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parses a datagram received from the SOCKS relay endpoint, returning the
/// embedded source (DST.ADDR/DST.PORT as seen by the backend) and payload.
/// Returns `None` on a malformed or fragmented packet rather than erroring,
/// matching the teacher's `decode_packet`, which logs and drops instead of
/// tearing down the session over one bad datagram.
pub(crate) fn decode_udp_packet(pkt: &[u8]) -> Option<(SocksAddr, u16, &[u8])> {
    if pkt.len() < 10 {
        debug!("UDP relay packet too short");
        return None;
    }
    let mut cursor = pkt;
    cursor.read_u16::<BE>().ok()?; // reserved
    if cursor.read_u8().ok()? != 0 {
        debug!("dropped fragmented UDP relay packet");
        return None;
    }
    let addr = match SocksAddr::read_from(&mut cursor) {
        Ok(addr) => addr,
        Err(err) => {
            debug!(%err, "malformed address in UDP relay packet");
            return None;
        }
    };
    let port = cursor.read_u16::<BE>().ok()?;
    Some((addr, port, cursor))
}
