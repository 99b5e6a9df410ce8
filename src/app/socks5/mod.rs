//! SOCKSv5 client codec (RFC 1928 / RFC 1929): greeting, CONNECT,
//! UDP-ASSOCIATE, and the UDP relay datagram framing (spec §4.2, §4.7).

mod addr;
mod codec;
mod connect;
mod framing;
mod udp_assoc;

pub(crate) use addr::SocksAddr;
pub(crate) use codec::{greet, Credentials};
pub(crate) use connect::connect;
pub(crate) use framing::{decode_udp_packet, encode_udp_packet};
pub(crate) use udp_assoc::udp_associate;
