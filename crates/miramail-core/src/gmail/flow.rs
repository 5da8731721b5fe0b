//! Installed-app OAuth consent over a loopback redirect.

use std::io;
use std::process::Command;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

use super::oauth::{
    AUTH_ENDPOINT, ClientSecrets, FileTokenStore, FileTokenStoreError, Grant, OAuthError,
    OAuthTokens, TokenEndpoint, TokenStore,
};

pub const CALLBACK_PATH: &str = "/oauth2callback";
pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(300);

const SUCCESS_HTML: &str = r#"<!doctype html>
<html>
  <head><title>miramail</title></head>
  <body style="font-family: sans-serif;">
    <h2>The authentication flow has completed. You may close this window.</h2>
  </body>
</html>
"#;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unexpected HTTP method {0}")]
    UnexpectedMethod(String),
    #[error("missing code in callback")]
    MissingCode,
    #[error("state mismatch in callback")]
    StateMismatch,
    #[error("timed out waiting for the OAuth callback")]
    Timeout,
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("token store error: {0}")]
    TokenStore(#[from] FileTokenStoreError),
}

pub fn random_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn build_auth_url(
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> Result<Url, FlowError> {
    build_auth_url_with_endpoint(AUTH_ENDPOINT, client_id, redirect_uri, scopes, state)
}

pub fn build_auth_url_with_endpoint(
    endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> Result<Url, FlowError> {
    let scope_value = scopes.join(" ");
    Url::parse_with_params(
        endpoint,
        [
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope_value.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
            ("include_granted_scopes", "true"),
        ],
    )
    .map_err(|err| FlowError::InvalidUrl(err.to_string()))
}

/// Accept connections on `listener` until a redirect reaches [`CALLBACK_PATH`],
/// then return its authorization code. Other requests get a 404.
pub async fn wait_for_code(
    listener: TcpListener,
    expected_state: String,
) -> Result<String, FlowError> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let request = match read_request_head(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                debug!(%addr, error = %err, "dropping unreadable connection");
                continue;
            }
        };

        // Browsers open speculative connections that close without a request.
        let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            continue;
        };

        let url = match Url::parse(&format!("http://localhost{target}")) {
            Ok(url) if url.path() == CALLBACK_PATH => url,
            _ => {
                debug!(%target, "ignoring request outside the callback path");
                send_response(&mut stream, 404, "Not found").await.ok();
                continue;
            }
        };

        if method != "GET" {
            send_response(&mut stream, 405, "Only GET is supported").await?;
            return Err(FlowError::UnexpectedMethod(method.to_string()));
        }

        return accept_callback(&mut stream, &url, &expected_state).await;
    }
}

async fn read_request_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    // Headers only; the callback never carries a body.
    for _ in 0..16 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn accept_callback(
    stream: &mut TcpStream,
    url: &Url,
    expected_state: &str,
) -> Result<String, FlowError> {
    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    let Some(code) = code.filter(|code| !code.is_empty()) else {
        send_response(stream, 400, "Missing code in callback. Please retry.").await?;
        return Err(FlowError::MissingCode);
    };

    if state.as_deref() != Some(expected_state) {
        send_response(stream, 400, "State mismatch, please retry.").await?;
        return Err(FlowError::StateMismatch);
    }

    send_response(stream, 200, SUCCESS_HTML).await?;
    Ok(code)
}

async fn send_response(stream: &mut TcpStream, status: u16, body: &str) -> io::Result<()> {
    let status_line = match status {
        400 => "400 Bad Request",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        _ => "200 OK",
    };

    let response = format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await
}

/// Run the full consent flow: loopback listener, browser, code exchange.
pub async fn run_installed_app_flow(
    secrets: &ClientSecrets,
    scopes: &[String],
) -> Result<OAuthTokens, FlowError> {
    let state = random_state();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");

    let auth_url = build_auth_url_with_endpoint(
        &secrets.auth_uri,
        &secrets.client_id,
        &redirect_uri,
        scopes,
        &state,
    )?;

    if let Err(err) = maybe_open_browser(auth_url.as_str()) {
        warn!(error = %err, "could not open a browser automatically");
    }
    info!(
        url = %auth_url,
        redirect_uri = %redirect_uri,
        "waiting for Google consent; open the URL if no browser appeared"
    );

    let code = time::timeout(CONSENT_TIMEOUT, wait_for_code(listener, state))
        .await
        .map_err(|_| FlowError::Timeout)??;

    info!("received authorization code, exchanging for tokens");
    let grant = Grant::AuthorizationCode {
        code: &code,
        redirect_uri: &redirect_uri,
    };
    let tokens = TokenEndpoint::for_secrets(secrets)
        .request(&Client::new(), grant)
        .await?;
    Ok(tokens)
}

/// Return saved tokens when the token file exists; otherwise run the consent
/// flow and save its result. Expired tokens are refreshed later by the client.
pub async fn load_or_authorize(
    secrets: &ClientSecrets,
    store: &FileTokenStore,
    scopes: &[String],
) -> Result<OAuthTokens, FlowError> {
    if let Some(tokens) = store.load().await? {
        info!(path = %store.path().display(), "using saved oauth tokens");
        return Ok(tokens);
    }

    let tokens = run_installed_app_flow(secrets, scopes).await?;
    store.save_tokens(&tokens).await?;
    Ok(tokens)
}

fn maybe_open_browser(url: &str) -> io::Result<()> {
    #[cfg(target_os = "macos")]
    let mut command = Command::new("open");
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = Command::new("xdg-open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut cmd = Command::new("cmd");
        let escaped_url = url.replace('"', "\"\"");
        cmd.arg("/C").arg(format!("start \"\" \"{escaped_url}\""));
        cmd
    };

    #[cfg(not(target_os = "windows"))]
    command.arg(url);
    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "browser command exited with status {status}"
        )))
    }
}
