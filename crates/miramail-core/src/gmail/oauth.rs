use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

/// Scopes needed to read, label, send and draft mail and to read signatures.
pub const DEFAULT_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.settings.basic",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

/// OAuth client registration, as downloaded from the Google Cloud console.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    AUTH_ENDPOINT.to_string()
}

fn default_token_uri() -> String {
    TOKEN_ENDPOINT.to_string()
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Error)]
pub enum ClientSecretsError {
    #[error("failed to read client secrets {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse client secrets: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("client secrets file has neither an `installed` nor a `web` section")]
    MissingSection,
}

impl ClientSecrets {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientSecretsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ClientSecretsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ClientSecretsError> {
        let file: ClientSecretsFile = serde_json::from_str(raw)?;
        file.installed
            .or(file.web)
            .ok_or(ClientSecretsError::MissingSection)
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopTokenStore;

#[async_trait]
impl TokenStore for NoopTokenStore {
    type Error = Infallible;

    async fn save_tokens(&self, _tokens: &OAuthTokens) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FileTokenStoreError {
    #[error("token file io error: {0}")]
    Io(#[from] io::Error),
    #[error("token file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persists tokens as a JSON file on disk.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the token file does not exist yet.
    pub async fn load(&self) -> Result<Option<OAuthTokens>, FileTokenStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    type Error = FileTokenStoreError;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(tokens)?;
        tokio::fs::write(&self.path, body).await?;
        tracing::debug!(path = %self.path.display(), "saved oauth tokens");
        Ok(())
    }
}

/// What is traded at the token endpoint for a fresh access token.
#[derive(Debug, Clone, Copy)]
pub enum Grant<'a> {
    /// Renew stored tokens. Google usually answers without a new refresh token.
    Refresh(&'a OAuthTokens),
    /// Finish the consent flow. The answer must carry a refresh token.
    AuthorizationCode {
        code: &'a str,
        redirect_uri: &'a str,
    },
}

impl<'a> Grant<'a> {
    fn form(self) -> Result<Vec<(&'static str, &'a str)>, OAuthError> {
        match self {
            Grant::Refresh(tokens) if tokens.refresh_token.is_empty() => {
                Err(OAuthError::MissingRefreshToken)
            }
            Grant::Refresh(tokens) => Ok(vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
            ]),
            Grant::AuthorizationCode { code, redirect_uri } => Ok(vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ]),
        }
    }

    fn previous_refresh_token(self) -> Option<&'a str> {
        match self {
            Grant::Refresh(tokens) => Some(tokens.refresh_token.as_str()),
            Grant::AuthorizationCode { .. } => None,
        }
    }
}

/// Where and as whom tokens are requested.
#[derive(Debug, Clone, Copy)]
pub struct TokenEndpoint<'a> {
    pub url: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

impl<'a> TokenEndpoint<'a> {
    pub fn google(client_id: &'a str, client_secret: &'a str) -> Self {
        Self {
            url: TOKEN_ENDPOINT,
            client_id,
            client_secret,
        }
    }

    pub fn for_secrets(secrets: &'a ClientSecrets) -> Self {
        Self {
            url: &secrets.token_uri,
            client_id: &secrets.client_id,
            client_secret: &secrets.client_secret,
        }
    }

    pub async fn request(
        self,
        http: &reqwest::Client,
        grant: Grant<'_>,
    ) -> Result<OAuthTokens, OAuthError> {
        let mut form = grant.form()?;
        form.extend([
            ("client_id", self.client_id),
            ("client_secret", self.client_secret),
        ]);

        let response = http.post(self.url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(OAuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        let granted: GrantedTokens = serde_json::from_str(&body)?;
        if granted.expires_in <= 0 {
            return Err(OAuthError::InvalidExpires(granted.expires_in));
        }
        let refresh_token = granted
            .refresh_token
            .filter(|token| !token.is_empty())
            .or_else(|| grant.previous_refresh_token().map(str::to_string))
            .ok_or(OAuthError::MissingRefreshToken)?;

        Ok(OAuthTokens {
            access_token: granted.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(granted.expires_in),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GrantedTokens {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn stale_tokens(refresh_token: &str) -> OAuthTokens {
        OAuthTokens {
            access_token: "old".into(),
            refresh_token: refresh_token.into(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn needs_refresh_respects_buffer() {
        let tokens = OAuthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + Duration::minutes(4),
        };

        assert!(tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER));
        assert!(!tokens.needs_refresh(Utc::now(), Duration::minutes(1)));
    }

    #[test]
    fn client_secrets_reads_installed_section() {
        let secrets = ClientSecrets::from_json(
            r#"{"installed": {
                "client_id": "id-1",
                "client_secret": "shh",
                "redirect_uris": ["http://localhost"]
            }}"#,
        )
        .expect("parse secrets");

        assert_eq!(secrets.client_id, "id-1");
        assert_eq!(secrets.client_secret, "shh");
        assert_eq!(secrets.auth_uri, AUTH_ENDPOINT);
        assert_eq!(secrets.token_uri, TOKEN_ENDPOINT);
    }

    #[test]
    fn client_secrets_falls_back_to_web_section() {
        let secrets = ClientSecrets::from_json(
            r#"{"web": {"client_id": "web-id", "client_secret": "s", "token_uri": "http://tok"}}"#,
        )
        .expect("parse secrets");

        assert_eq!(secrets.client_id, "web-id");
        assert_eq!(secrets.token_uri, "http://tok");
    }

    #[test]
    fn client_secrets_without_section_errors() {
        let err = ClientSecrets::from_json(r#"{"other": {}}"#).expect_err("no section");
        assert!(matches!(err, ClientSecretsError::MissingSection));
    }

    #[test]
    fn client_secrets_missing_file_reports_path() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("nope.json");
        let err = ClientSecrets::from_file(&missing).expect_err("missing file");
        match err {
            ClientSecretsError::Io { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn file_token_store_round_trips_and_creates_parent() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(dir.path().join("nested/token.json"));

        assert!(store.load().await.expect("load").is_none());

        let tokens = OAuthTokens {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        store.save_tokens(&tokens).await.expect("save");

        let loaded = store.load().await.expect("load").expect("tokens present");
        assert_eq!(loaded, tokens);
    }

    #[tokio::test]
    async fn file_token_store_rejects_garbage() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("token.json");
        std::fs::write(&path, "not json").expect("write");

        let err = FileTokenStore::new(&path).load().await.expect_err("garbage");
        assert!(matches!(err, FileTokenStoreError::Json(_)));
    }

    fn endpoint(server: &MockServer) -> String {
        format!("{}/token", server.uri())
    }

    async fn mount_grant(server: &MockServer, grant_type: &str, answer: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(format!("grant_type={grant_type}")))
            .and(body_string_contains("client_id=client"))
            .respond_with(answer)
            .expect(1)
            .mount(server)
            .await;
    }

    async fn request(server: &MockServer, grant: Grant<'_>) -> Result<OAuthTokens, OAuthError> {
        let url = endpoint(server);
        let token_endpoint = TokenEndpoint {
            url: &url,
            client_id: "client",
            client_secret: "secret",
        };
        token_endpoint.request(&reqwest::Client::new(), grant).await
    }

    #[tokio::test]
    async fn refresh_keeps_the_stored_refresh_token_unless_replaced() {
        let server = MockServer::start().await;
        mount_grant(
            &server,
            "refresh_token",
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "renewed",
                "expires_in": 1200,
                "token_type": "Bearer",
            })),
        )
        .await;

        let tokens = stale_tokens("keep_me");
        let refreshed = request(&server, Grant::Refresh(&tokens))
            .await
            .expect("refresh succeeds");
        assert_eq!(refreshed.access_token, "renewed");
        assert_eq!(refreshed.refresh_token, "keep_me");
        assert!(refreshed.expires_at > tokens.expires_at);
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_the_old_one() {
        let server = MockServer::start().await;
        mount_grant(
            &server,
            "refresh_token",
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "renewed",
                "refresh_token": "rotated",
                "expires_in": 3600,
            })),
        )
        .await;

        let refreshed = request(&server, Grant::Refresh(&stale_tokens("old")))
            .await
            .expect("refresh succeeds");
        assert_eq!(refreshed.refresh_token, "rotated");
    }

    #[tokio::test]
    async fn code_exchange_must_yield_a_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("code=code123"))
            .and(body_string_contains("redirect_uri="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "refresh_token": "",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = Grant::AuthorizationCode {
            code: "code123",
            redirect_uri: "http://127.0.0.1:8080/oauth2callback",
        };
        let err = request(&server, grant).await.expect_err("no refresh token");
        assert!(matches!(err, OAuthError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn code_exchange_returns_both_tokens() {
        let server = MockServer::start().await;
        mount_grant(
            &server,
            "authorization_code",
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_in": 3600,
            })),
        )
        .await;

        let grant = Grant::AuthorizationCode {
            code: "code123",
            redirect_uri: "http://localhost/callback",
        };
        let tokens = request(&server, grant).await.expect("tokens");
        assert_eq!(tokens.access_token, "access");
        assert_eq!(tokens.refresh_token, "refresh");
        assert!(tokens.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn rejected_grant_surfaces_status_and_body() {
        let server = MockServer::start().await;
        mount_grant(
            &server,
            "refresh_token",
            ResponseTemplate::new(400).set_body_string("invalid_grant"),
        )
        .await;

        match request(&server, Grant::Refresh(&stale_tokens("r"))).await {
            Err(OAuthError::TokenEndpoint { status, body }) => {
                assert_eq!((status, body.as_str()), (400, "invalid_grant"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_positive_lifetimes_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new",
                "refresh_token": "r",
                "expires_in": 0,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = request(&server, Grant::Refresh(&stale_tokens("r")))
            .await
            .expect_err("zero lifetime");
        assert!(matches!(err, OAuthError::InvalidExpires(0)));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_never_calls_the_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let err = request(&server, Grant::Refresh(&stale_tokens("")))
            .await
            .expect_err("missing refresh token");
        assert!(matches!(err, OAuthError::MissingRefreshToken));
    }

    #[test]
    fn secrets_point_at_their_own_token_uri() {
        let secrets = ClientSecrets::from_json(
            r#"{"web": {"client_id": "id", "client_secret": "s", "token_uri": "http://tok"}}"#,
        )
        .expect("parse secrets");
        let endpoint = TokenEndpoint::for_secrets(&secrets);
        assert_eq!((endpoint.url, endpoint.client_id), ("http://tok", "id"));
        assert_eq!(TokenEndpoint::google("a", "b").url, TOKEN_ENDPOINT);
    }
}
