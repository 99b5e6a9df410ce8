use std::{
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::unix::io::AsRawFd,
};

use tokio::net::TcpStream;

use crate::app::error::ProxyError;

/// `SOL_IP`/`SO_ORIGINAL_DST` on Linux (iptables/nftables REDIRECT, v4).
const SO_ORIGINAL_DST: libc::c_int = 80;
/// `SOL_IPV6`/`IP6T_SO_ORIGINAL_DST` (ip6tables REDIRECT, v6). Same numeric
/// value as the v4 option, just scoped to `IPPROTO_IPV6`.
const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// Recovers the pre-redirect destination of an accepted TCP socket (spec §4.1).
///
/// Tries the IPv4 option first, then IPv6, matching the original
/// implementation's fallback order. Returns
/// [`ProxyError::OriginalDstUnavailable`] if neither call succeeds, which
/// happens when the socket was never redirected by the packet filter or the
/// platform doesn't support the query.
pub(crate) fn original_dst_tcp(stream: &TcpStream) -> Result<SocketAddr, ProxyError> {
    let fd = stream.as_raw_fd();
    if let Some(addr) = getsockopt_original_dst_v4(fd) {
        return Ok(addr);
    }
    if let Some(addr) = getsockopt_original_dst_v6(fd) {
        return Ok(addr);
    }
    Err(ProxyError::OriginalDstUnavailable)
}

fn getsockopt_original_dst_v4(fd: libc::c_int) -> Option<SocketAddr> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut raw as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
    let port = u16::from_be(raw.sin_port);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

fn getsockopt_original_dst_v6(fd: libc::c_int) -> Option<SocketAddr> {
    let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IPV6,
            IP6T_SO_ORIGINAL_DST,
            &mut raw as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);
    let port = u16::from_be(raw.sin6_port);
    Some(SocketAddr::V6(SocketAddrV6::new(
        ip,
        port,
        raw.sin6_flowinfo,
        raw.sin6_scope_id,
    )))
}
