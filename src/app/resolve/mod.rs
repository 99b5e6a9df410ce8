//! Original-destination resolution (spec §4.1).
//!
//! The kernel rewrites the socket's peer address to the proxy's own listening
//! endpoint once a filter rule redirects a flow here; these helpers read back
//! the pre-redirect destination the client actually dialed.

mod tcp;
mod udp;

pub(crate) use tcp::original_dst_tcp;
pub(crate) use udp::{bind_tproxy_udp, recv_with_orig_dst, TProxyUdpSocket};
