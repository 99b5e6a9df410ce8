//! UDP session manager (spec §4.7, C7): per-client relay/direct sessions
//! over the TPROXY listener socket, plus the idle-session reaper.

mod listener;
mod reaper;
mod session;

use std::sync::Arc;

use dashmap::DashMap;

use crate::app::types::ClientAddr;

pub(crate) use listener::run;
pub(crate) use reaper::run_reaper;
use session::UdpSession;

/// Live sessions keyed by client endpoint, held by the listener task and
/// shared with the reaper. Distinct from the registry's `UdpSessionRecord`
/// map: this table owns the sockets and control connections, the registry
/// only ever sees the lightweight record used for telemetry and admin kill.
pub(crate) type SessionTable = DashMap<ClientAddr, Arc<UdpSession>>;
