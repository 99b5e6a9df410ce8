//! TCP forwarder (spec §4.6, C6): per-connection target resolution,
//! protocol classification, policy application, dial, and the splice loop.

mod forwarder;
mod splice;

pub(crate) use forwarder::handle_connection;
