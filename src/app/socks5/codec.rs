use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::app::error::ProxyError;

const VERSION: u8 = 0x05;
const METHOD_NOAUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

/// Runs the RFC 1928 method-negotiation handshake, falling through to RFC
/// 1929 username/password auth when the backend requires it. Grounded on
/// the original's `socks5_connect_via`, which offers NOAUTH plus
/// USERNAME/PASSWORD only when credentials were supplied, and treats
/// `0xFF` as a hard failure.
pub(crate) async fn greet<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    creds: Option<&Credentials>,
) -> Result<(), ProxyError> {
    let methods: &[u8] = if creds.is_some() {
        &[METHOD_NOAUTH, METHOD_USERPASS]
    } else {
        &[METHOD_NOAUTH]
    };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream
        .write_all(&greeting)
        .await
        .map_err(ProxyError::SocketError)?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(ProxyError::SocketError)?;
    let [ver, method] = reply;
    if ver != VERSION {
        return Err(ProxyError::SocksHandshake(format!(
            "unexpected version {ver:#x} in method reply"
        )));
    }
    match method {
        METHOD_NOAUTH => Ok(()),
        METHOD_USERPASS => {
            let creds = creds.ok_or_else(|| {
                ProxyError::SocksHandshake("backend requires credentials we don't have".into())
            })?;
            authenticate(stream, creds).await
        }
        METHOD_NONE_ACCEPTABLE => Err(ProxyError::SocksHandshake(
            "backend rejected all offered auth methods".into(),
        )),
        other => Err(ProxyError::SocksHandshake(format!(
            "unsupported auth method {other:#x}"
        ))),
    }
}

async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    creds: &Credentials,
) -> Result<(), ProxyError> {
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(ProxyError::SocksHandshake(
            "username/password too long for RFC 1929".into(),
        ));
    }
    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(0x01);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    stream.write_all(&req).await.map_err(ProxyError::SocketError)?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(ProxyError::SocketError)?;
    let [ver, status] = reply;
    if ver != 0x01 || status != 0x00 {
        return Err(ProxyError::AuthFailure);
    }
    Ok(())
}
