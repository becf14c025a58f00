//! Loopback HTTP server that receives TikTok's OAuth redirect.
//!
//! Used by interactive logins: the redirect URI registered with TikTok points at a port on this
//! machine, the user approves access in their browser, and TikTok sends the browser back here
//! with `code` and `state` in the query string.

use crate::credentials::SubjectId;
use crate::error::TikTokError;
use crate::oauth::OAuthStateStore;
use bytes::Bytes;
use eyre::Context;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body;
use hyper::service::service_fn;
use oauth2::{AuthorizationCode, RedirectUrl};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

const DEFAULT_DONE_HTML: &str = "<!DOCTYPE html>\
<html><body><p>TikTok account linked. You can close this window.</p></body></html>";

/// Listens on the host and port of a loopback redirect URI.
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    path: String,
    done_html: &'static str,
}

impl CallbackServer {
    /// Binds the address named by `redirect_uri`.
    ///
    /// Only loopback addresses are accepted. Port 0 binds an ephemeral port; see
    /// [`CallbackServer::local_addr`].
    pub async fn bind(redirect_uri: &RedirectUrl) -> Result<Self, TikTokError> {
        let url = redirect_uri.url();
        let addrs = url
            .socket_addrs(|| None)
            .context("resolve redirect URI address")?;
        if addrs.is_empty() || !addrs.iter().all(|addr| addr.ip().is_loopback()) {
            return Err(eyre::eyre!("redirect URI {url} is not a loopback address").into());
        }

        let listener = TcpListener::bind(&*addrs)
            .await
            .with_context(|| format!("bind redirect listener for {url}"))?;
        Ok(Self {
            listener,
            path: url.path().to_string(),
            done_html: DEFAULT_DONE_HTML,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TikTokError> {
        Ok(self.listener.local_addr().context("get local address")?)
    }

    /// Page shown in the browser once the redirect has been accepted.
    pub fn with_done_html(mut self, html: &'static str) -> Self {
        self.done_html = html;
        self
    }

    /// Serves redirects until one arrives at the callback path, then returns what it carried.
    ///
    /// Requests to other paths (the browser's favicon request, say) get a 404 and are otherwise
    /// ignored. Requests with a missing, unknown, or expired state get a 400 and the server keeps
    /// listening. The first request whose state is redeemed from `states` decides the outcome,
    /// so the same redirect cannot be replayed.
    pub async fn wait_for_authorization(
        self,
        states: Arc<OAuthStateStore>,
    ) -> Result<(SubjectId, AuthorizationCode), TikTokError> {
        let (got, mut gotten) = tokio::sync::mpsc::channel(1);
        let path: Arc<str> = self.path.into();
        let done_html = self.done_html;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (conn, peer) = accepted.context("accept redirect connection")?;
                    let conn = hyper_util::rt::TokioIo::new(conn);
                    let states = Arc::clone(&states);
                    let path = Arc::clone(&path);
                    let got = got.clone();
                    let service = service_fn(move |req: Request<body::Incoming>| {
                        let states = Arc::clone(&states);
                        let path = Arc::clone(&path);
                        let got = got.clone();
                        async move {
                            let outcome = interpret_redirect(req.uri(), &path, &states);
                            let response = redirect_response(outcome.as_ref(), done_html);
                            match outcome {
                                // nothing was consumed, so the real redirect may still come
                                None | Some(Err(TikTokError::InvalidState)) => {}
                                Some(outcome) => {
                                    // the receiver is gone once an earlier redirect has won
                                    let _ = got.send(outcome).await;
                                }
                            }
                            Ok::<_, Infallible>(response)
                        }
                    });
                    tokio::spawn(async move {
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .keep_alive(false)
                            .serve_connection(conn, service)
                            .await
                        {
                            tracing::debug!(%peer, error = %e, "redirect connection failed");
                        }
                    });
                }
                outcome = gotten.recv() => {
                    let (subject, code) = outcome
                        .ok_or_else(|| eyre::eyre!("redirect server stopped prematurely"))??;
                    tracing::info!(%subject, "received TikTok authorization redirect");
                    return Ok((subject, code));
                }
            }
        }
    }
}

/// Decodes a redirect request.
///
/// Returns `None` for requests that are not for `expected_path`. Otherwise the state is
/// consumed first, so an unknown or replayed state is rejected even when TikTok reports an
/// error, and only then are `error` and `code` looked at.
pub fn interpret_redirect(
    uri: &Uri,
    expected_path: &str,
    states: &OAuthStateStore,
) -> Option<Result<(SubjectId, AuthorizationCode), TikTokError>> {
    if uri.path() != expected_path {
        return None;
    }

    let mut state = None;
    let mut code = None;
    let mut error = None;
    let mut error_description = None;
    for (k, v) in form_urlencoded::parse(uri.query().unwrap_or("").as_bytes()) {
        match &*k {
            "state" => state = Some(v.into_owned()),
            "code" => code = Some(v.into_owned()),
            "error" => error = Some(v.into_owned()),
            "error_description" => error_description = Some(v.into_owned()),
            _ => {}
        }
    }

    let outcome = (|| {
        let state = state.ok_or(TikTokError::InvalidState)?;
        let subject = states.consume(&state)?;
        if let Some(error) = error {
            return Err(TikTokError::api(
                error,
                error_description.unwrap_or_else(|| "authorization was not granted".to_string()),
            ));
        }
        let code = code.filter(|c| !c.is_empty()).ok_or_else(|| {
            TikTokError::api(
                "invalid_request",
                "redirect did not include an authorization code",
            )
        })?;
        Ok((subject, AuthorizationCode::new(code)))
    })();
    Some(outcome)
}

fn redirect_response(
    outcome: Option<&Result<(SubjectId, AuthorizationCode), TikTokError>>,
    done_html: &'static str,
) -> Response<Full<Bytes>> {
    let (status, content_type, body) = match outcome {
        None => (
            StatusCode::NOT_FOUND,
            "text/plain; charset=utf-8",
            Bytes::from_static(b"not found"),
        ),
        Some(Ok(_)) => (
            StatusCode::OK,
            "text/html; charset=utf-8",
            Bytes::from_static(done_html.as_bytes()),
        ),
        Some(Err(e)) => (
            StatusCode::BAD_REQUEST,
            "text/plain; charset=utf-8",
            Bytes::from(e.to_string()),
        ),
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
