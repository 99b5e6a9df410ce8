use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, warn};

use crate::app::{
    context::AppContext,
    error::ProxyError,
    pool::Backend,
    registry::UdpSessionRecord,
    resolve::TProxyUdpSocket,
    socks5::{self, SocksAddr},
    types::{ClientAddr, KillReason, TargetAddr},
};

const UDP_RECV_BUFFER: usize = 64 * 1024;

/// A live per-client UDP session (spec §4.7): either a SOCKS5 relay session
/// (control TCP held open for the association's lifetime, plus an
/// ephemeral data socket connected to the relay) or a direct session (the
/// data socket connected straight to the original target). Grounded on the
/// teacher's `socks5/session.rs`, which pairs a control connection with a
/// per-session `UdpSocket` the same way; generalized here to one session
/// per *client* endpoint rather than per backend selection.
pub(crate) struct UdpSession {
    pub(crate) record: Arc<UdpSessionRecord>,
    data_socket: UdpSocket,
    relayed: bool,
    backend: Option<Arc<Backend>>,
    /// Pseudo-backend used to collect TTL samples for direct sessions,
    /// which have no real [`Backend`] to attribute them to (spec §4.7's
    /// "TTL integrity" note).
    direct_ttl_sink: Option<Backend>,
}

impl UdpSession {
    pub(crate) async fn open_socks(
        ctx: &AppContext,
        client: ClientAddr,
        target: TargetAddr,
        backend: Arc<Backend>,
    ) -> Result<Self, ProxyError> {
        let ip = ctx.dns.resolve(&backend.host).await?;
        let mut control = TcpStream::connect(SocketAddr::new(ip, backend.port))
            .await
            .map_err(ProxyError::SocketError)?;
        socks5::greet(&mut control, ctx.socks_creds.as_ref()).await?;
        let mut relay_addr = socks5::udp_associate(&mut control).await?;
        if relay_addr.ip().is_unspecified() {
            let peer = control.peer_addr().map_err(ProxyError::SocketError)?;
            relay_addr.set_ip(peer.ip());
        }

        let data_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(ProxyError::SocketError)?;
        data_socket
            .connect(relay_addr)
            .await
            .map_err(ProxyError::SocketError)?;

        let record = Arc::new(UdpSessionRecord::new(client, target, false));
        tokio::spawn(watch_control_connection(control, record.clone()));

        Ok(Self {
            record,
            data_socket,
            relayed: true,
            backend: Some(backend),
            direct_ttl_sink: None,
        })
    }

    pub(crate) async fn open_direct(
        client: ClientAddr,
        target: TargetAddr,
    ) -> Result<Self, ProxyError> {
        let data_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(ProxyError::SocketError)?;
        data_socket
            .connect(target.0)
            .await
            .map_err(ProxyError::SocketError)?;
        Ok(Self {
            record: Arc::new(UdpSessionRecord::new(client, target, true)),
            data_socket,
            relayed: false,
            backend: None,
            direct_ttl_sink: Some(Backend::new(client.0.ip().to_string(), client.0.port())),
        })
    }

    /// Frames (if relayed) and sends one client-to-target datagram (spec
    /// §4.7 step 4).
    pub(crate) async fn send(&self, target: TargetAddr, payload: &[u8]) -> Result<(), ProxyError> {
        if self.relayed {
            let dst = SocksAddr::from(target.0.ip());
            let framed = socks5::encode_udp_packet(&dst, target.0.port(), payload)?;
            self.data_socket
                .send(&framed)
                .await
                .map_err(ProxyError::SocketError)?;
        } else {
            self.data_socket
                .send(payload)
                .await
                .map_err(ProxyError::SocketError)?;
        }
        self.record.touch();
        self.record.bytes_c2r.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Per-session receive loop (spec §4.7 step 5): reads relay/direct
    /// datagrams and forwards the payload back to the client through the
    /// shared TPROXY listener socket, which is the only socket allowed to
    /// claim the original destination as its send-from address.
    pub(crate) async fn run_receive_loop(
        self: Arc<Self>,
        ctx: AppContext,
        listener: Arc<TProxyUdpSocket>,
        sessions: Arc<super::SessionTable>,
        client: ClientAddr,
    ) {
        let client_addr = client.0;
        let mut buf = vec![0u8; UDP_RECV_BUFFER];
        loop {
            tokio::select! {
                _ = self.record.wait_for_kill() => {
                    debug!(%client_addr, "UDP session killed");
                    break;
                }
                result = self.data_socket.recv(&mut buf) => {
                    let n = match result {
                        Ok(n) => n,
                        Err(err) => {
                            warn!(%err, %client_addr, "UDP session recv failed");
                            break;
                        }
                    };
                    let payload = if self.relayed {
                        match socks5::decode_udp_packet(&buf[..n]) {
                            Some((_addr, _port, payload)) => payload,
                            None => &buf[..n],
                        }
                    } else {
                        &buf[..n]
                    };
                    if listener.send_to(payload, client_addr).await.is_err() {
                        break;
                    }
                    self.record.touch();
                    let len = payload.len() as u64;
                    self.record.bytes_r2c.fetch_add(len, Ordering::Relaxed);
                    ctx.registry.counters.add_remote_to_client(len);
                    if let Some(backend) = &self.backend {
                        backend.add_bytes(len, Duration::from_secs(1));
                    }
                }
            }
        }
        // `remove_if` guards against a new session for the same client
        // having replaced this entry while this loop was winding down; only
        // the table/registry entry ownership is conditional on it. The
        // active-session count is decremented unconditionally since every
        // session increments it exactly once at creation, regardless of
        // whether it's still the one occupying `client`'s table slot.
        let still_current = sessions
            .remove_if(&client, |_, v| Arc::ptr_eq(v, &self))
            .is_some();
        if still_current {
            ctx.registry.remove_udp(&client);
        }
        ctx.registry
            .counters
            .udp_sessions_active
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Closes the session as soon as its control connection reports EOF or an
/// error, per the Open Question (b) decision: a dead control connection
/// means the backend has torn down the relay, so waiting for the idle
/// reaper to notice would leave the session black-holed in the meantime.
async fn watch_control_connection(mut control: TcpStream, record: Arc<UdpSessionRecord>) {
    let mut buf = [0u8; 1];
    loop {
        tokio::select! {
            _ = record.wait_for_kill() => return,
            result = control.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("UDP association control connection closed");
                        record.kill(KillReason::ControlClosed);
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "UDP association control connection error");
                        record.kill(KillReason::ControlClosed);
                        return;
                    }
                }
            }
        }
    }
}
