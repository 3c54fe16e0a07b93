//! Websocket relay between a client and a `ws://` or `wss://` upstream
//!
//! The client leg is accepted immediately with a 101 response. Messages the
//! client sends while the upstream handshake is still in flight are queued and
//! flushed in order once it completes.

use crate::error::{empty, BoxError, ProxyBody};
use crate::proxy::UpstreamConnector;
use futures::{Sink, SinkExt, StreamExt};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::upgrade::OnUpgrade;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::either::Either;
use tracing::{debug, warn};

type UpstreamSocket =
    WebSocketStream<Either<TcpStream, tokio_rustls::client::TlsStream<TcpStream>>>;

/// Whether a request asks to switch to the websocket protocol
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    upgrade && connection
}

/// Build the 101 response accepting a client handshake
pub fn accept_response(headers: &HeaderMap) -> Result<Response<ProxyBody>, &'static str> {
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or("missing Sec-WebSocket-Key")?;

    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok());
    if version != Some("13") {
        return Err("unsupported Sec-WebSocket-Version");
    }

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));

    if let Some(protocol) = first_protocol(headers) {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    Ok(builder.body(empty()).expect("valid response builder"))
}

fn first_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let offered = headers.get(header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let first = offered.split(',').next()?.trim();
    HeaderValue::from_str(first).ok().filter(|_| !first.is_empty())
}

/// Close frame to forward to the other leg.
///
/// 1004, 1005 and 1006 are reserved and may not be sent on the wire, so they
/// and a missing status become a normal closure.
pub fn translate_close(frame: Option<CloseFrame>) -> CloseFrame {
    match frame {
        Some(frame) => match u16::from(frame.code) {
            1004..=1006 => CloseFrame {
                code: CloseCode::Normal,
                reason: frame.reason,
            },
            _ => frame,
        },
        None => CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        },
    }
}

/// Complete the client upgrade and relay messages to `target` until either side closes
pub async fn relay(
    on_upgrade: OnUpgrade,
    connector: UpstreamConnector,
    target: String,
    protocols: Option<HeaderValue>,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(error = %e, "Websocket upgrade failed");
            return;
        }
    };

    let mut client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let connect = connect_upstream(&connector, &target, protocols);
    tokio::pin!(connect);

    let mut queue = VecDeque::new();
    let mut upstream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(socket) => break socket,
                Err(e) => {
                    warn!(upstream = %target, error = %e, "Websocket upstream connection failed");
                    close_leg(&mut client, translate_close(None)).await;
                    return;
                }
            },
            msg = client.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(upstream = %target, "Websocket client left before upstream opened");
                    return;
                }
                Some(Ok(msg)) => queue.push_back(msg),
                Some(Err(e)) => {
                    warn!(error = %e, "Websocket client error");
                    return;
                }
            },
        }
    };

    debug!(upstream = %target, queued = queue.len(), "Websocket upstream connected");
    while let Some(msg) = queue.pop_front() {
        if let Err(e) = upstream.send(msg).await {
            warn!(upstream = %target, error = %e, "Websocket upstream error");
            close_leg(&mut client, translate_close(None)).await;
            return;
        }
    }

    pump(client, upstream, &target).await;
}

/// Forward messages both ways until one leg closes or fails, then close the other
async fn pump<C>(client: WebSocketStream<C>, upstream: UpstreamSocket, target: &str)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    close_leg(&mut upstream_tx, translate_close(frame)).await;
                    let _ = client_tx.close().await;
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(msg)) => {
                    if let Err(e) = upstream_tx.send(msg).await {
                        warn!(upstream = %target, error = %e, "Websocket upstream error");
                        close_leg(&mut client_tx, translate_close(None)).await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Websocket client error");
                    close_leg(&mut upstream_tx, translate_close(None)).await;
                    break;
                }
                None => {
                    close_leg(&mut upstream_tx, translate_close(None)).await;
                    break;
                }
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    close_leg(&mut client_tx, translate_close(frame)).await;
                    let _ = upstream_tx.close().await;
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(msg)) => {
                    if let Err(e) = client_tx.send(msg).await {
                        warn!(error = %e, "Websocket client error");
                        close_leg(&mut upstream_tx, translate_close(None)).await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(upstream = %target, error = %e, "Websocket upstream error");
                    close_leg(&mut client_tx, translate_close(None)).await;
                    break;
                }
                None => {
                    close_leg(&mut client_tx, translate_close(None)).await;
                    break;
                }
            },
        }
    }

    debug!(upstream = %target, "Websocket relay finished");
}

async fn close_leg<S>(sink: &mut S, frame: CloseFrame)
where
    S: Sink<Message> + Unpin,
{
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

async fn connect_upstream(
    connector: &UpstreamConnector,
    target: &str,
    protocols: Option<HeaderValue>,
) -> Result<UpstreamSocket, BoxError> {
    let mut request = target.into_client_request()?;

    let uri = request.uri();
    let tls = match uri.scheme_str() {
        Some("ws") => false,
        Some("wss") => true,
        other => return Err(format!("unsupported websocket scheme {:?}", other).into()),
    };
    let host = uri
        .host()
        .ok_or("websocket target has no host")?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    if let Some(protocols) = protocols {
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols);
    }

    let stream = connector.connect(&host, port, tls).await?;
    let (socket, _) = tokio_tungstenite::client_async(request, stream).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(code: u16, reason: &str) -> Option<CloseFrame> {
        Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })
    }

    #[test]
    fn test_translate_reserved_codes() {
        for code in [1004, 1005, 1006] {
            let frame = translate_close(close(code, "gone"));
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason.as_str(), "gone");
        }
    }

    #[test]
    fn test_translate_missing_status() {
        let frame = translate_close(None);
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason.as_str(), "");
    }

    #[test]
    fn test_translate_keeps_other_codes() {
        let frame = translate_close(close(4001, "custom"));
        assert_eq!(u16::from(frame.code), 4001);

        let frame = translate_close(close(1001, "bye"));
        assert_eq!(frame.code, CloseCode::Away);
        assert_eq!(frame.reason.as_str(), "bye");
    }

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade_request(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn test_accept_response() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat, superchat"));

        let response = accept_response(&headers).unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_ACCEPT).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(), "chat");
    }

    #[test]
    fn test_accept_response_requires_key() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        assert!(accept_response(&headers).is_err());
    }
}
