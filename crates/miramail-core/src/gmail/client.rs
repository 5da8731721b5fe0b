use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::gmail::oauth::{
    DEFAULT_REFRESH_BUFFER, Grant, OAuthError, OAuthTokens, TOKEN_ENDPOINT, TokenEndpoint,
    TokenStore,
};
use crate::gmail::types::{
    AttachmentBody, CreateDraftRequest, CreateLabelRequest, DraftResponse, GmailLabel,
    ListDraftsResponse, ListLabelsResponse, ListMessagesResponse, ListThreadsResponse, Message,
    ModifyMessageRequest, Profile, SendAs, SendMessageRequest, Thread,
};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("could not persist refreshed tokens: {0}")]
    TokenStore(String),
    #[error("unexpected gmail response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("gmail rejected a freshly refreshed token")]
    Unauthorized,
}

/// Filters shared by `messages.list` and `threads.list`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListParams<'a> {
    pub q: Option<&'a str>,
    pub label_ids: &'a [String],
    pub page_token: Option<&'a str>,
    pub include_spam_trash: bool,
    pub max_results: Option<u32>,
}

impl ListParams<'_> {
    fn to_query(self) -> Vec<(&'static str, String)> {
        let mut pairs: Vec<(&'static str, String)> = self
            .label_ids
            .iter()
            .map(|id| ("labelIds", id.clone()))
            .collect();
        if let Some(q) = self.q {
            pairs.push(("q", q.to_string()));
        }
        if let Some(token) = self.page_token {
            pairs.push(("pageToken", token.to_string()));
        }
        if self.include_spam_trash {
            pairs.push(("includeSpamTrash", "true".to_string()));
        }
        if let Some(max) = self.max_results {
            pairs.push(("maxResults", max.to_string()));
        }
        pairs
    }
}

/// Thin Gmail v1 REST client for one mailbox. Keeps the access token fresh
/// and writes every refreshed token back through the [`TokenStore`].
pub struct GmailClient<S: TokenStore> {
    http: Client,
    user_id: String,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_endpoint: String,
    // Held across a refresh so concurrent callers wait for the new token.
    tokens: Mutex<OAuthTokens>,
    token_store: Arc<S>,
}

impl<S: TokenStore> GmailClient<S> {
    pub fn new(
        http: Client,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tokens: OAuthTokens,
        token_store: Arc<S>,
    ) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            tokens: Mutex::new(tokens),
            token_store,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn get_profile(&self) -> Result<Profile, GmailClientError> {
        self.get("profile", &[]).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        self.get(&format!("messages/{message_id}"), &full_format())
            .await
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Thread, GmailClientError> {
        self.get(&format!("threads/{thread_id}"), &full_format())
            .await
    }

    pub async fn list_messages(
        &self,
        params: ListParams<'_>,
    ) -> Result<ListMessagesResponse, GmailClientError> {
        self.get("messages", &params.to_query()).await
    }

    pub async fn list_threads(
        &self,
        params: ListParams<'_>,
    ) -> Result<ListThreadsResponse, GmailClientError> {
        self.get("threads", &params.to_query()).await
    }

    /// Adds and removes labels; the response carries the resulting label ids.
    pub async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<Message, GmailClientError> {
        let body = ModifyMessageRequest {
            add_label_ids: add_label_ids.to_vec(),
            remove_label_ids: remove_label_ids.to_vec(),
        };
        self.post(&format!("messages/{message_id}/modify"), Some(&body))
            .await
    }

    pub async fn trash_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        self.post::<_, ()>(&format!("messages/{message_id}/trash"), None)
            .await
    }

    pub async fn untrash_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        self.post::<_, ()>(&format!("messages/{message_id}/untrash"), None)
            .await
    }

    /// Sends a base64url-encoded RFC 822 message, optionally inside `thread_id`.
    pub async fn send_message(
        &self,
        raw: &str,
        thread_id: Option<&str>,
    ) -> Result<Message, GmailClientError> {
        self.post("messages/send", Some(&outgoing(raw, thread_id)))
            .await
    }

    pub async fn create_draft(
        &self,
        raw: &str,
        thread_id: Option<&str>,
    ) -> Result<DraftResponse, GmailClientError> {
        let body = CreateDraftRequest {
            message: outgoing(raw, thread_id),
        };
        self.post("drafts", Some(&body)).await
    }

    pub async fn get_draft(&self, draft_id: &str) -> Result<DraftResponse, GmailClientError> {
        self.get(&format!("drafts/{draft_id}"), &full_format()).await
    }

    pub async fn list_drafts(
        &self,
        page_token: Option<&str>,
    ) -> Result<ListDraftsResponse, GmailClientError> {
        let query: Vec<_> = page_token
            .map(|token| ("pageToken", token.to_string()))
            .into_iter()
            .collect();
        self.get("drafts", &query).await
    }

    pub async fn list_labels(&self) -> Result<ListLabelsResponse, GmailClientError> {
        self.get("labels", &[]).await
    }

    pub async fn create_label(
        &self,
        request: &CreateLabelRequest,
    ) -> Result<GmailLabel, GmailClientError> {
        self.post("labels", Some(request)).await
    }

    pub async fn delete_label(&self, label_id: &str) -> Result<(), GmailClientError> {
        let url = self.url(&format!("labels/{label_id}"));
        self.authorized(|| self.http.delete(&url)).await?;
        Ok(())
    }

    pub async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, GmailClientError> {
        let path = format!("messages/{message_id}/attachments/{attachment_id}");
        self.get(&path, &[]).await
    }

    /// Looks up a send-as alias, which carries the account's HTML signature.
    pub async fn get_send_as(&self, address: &str) -> Result<SendAs, GmailClientError> {
        self.get(&format!("settings/sendAs/{address}"), &[]).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.user_id, path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GmailClientError> {
        let url = self.url(path);
        let response = self.authorized(|| self.http.get(&url).query(query)).await?;
        decode(response).await
    }

    async fn post<T, B>(&self, path: &str, body: Option<&B>) -> Result<T, GmailClientError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let url = self.url(path);
        let response = self
            .authorized(|| match body {
                Some(body) => self.http.post(&url).json(body),
                None => self.http.post(&url),
            })
            .await?;
        decode(response).await
    }

    /// Sends the request with the current token. A 401 refreshes the token and
    /// sends once more.
    #[instrument(skip_all)]
    async fn authorized<B>(&self, build: B) -> Result<Response, GmailClientError>
    where
        B: Fn() -> RequestBuilder + Send + Sync,
    {
        let token = self.access_token(None).await?;
        let response = build().bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response.error_for_status()?);
        }

        debug!("gmail rejected the access token, refreshing");
        let token = self.access_token(Some(&token)).await?;
        let response = build().bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GmailClientError::Unauthorized);
        }
        Ok(response.error_for_status()?)
    }

    /// The token to use for the next request. Refreshes when the current one is
    /// close to expiry, or when Gmail just rejected `rejected` and nobody has
    /// replaced it yet.
    async fn access_token(&self, rejected: Option<&str>) -> Result<String, GmailClientError> {
        let mut tokens = self.tokens.lock().await;
        let stale = match rejected {
            Some(rejected) => tokens.access_token == rejected,
            None => tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER),
        };
        if !stale {
            return Ok(tokens.access_token.clone());
        }

        let endpoint = TokenEndpoint {
            url: &self.token_endpoint,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
        };
        let refreshed = endpoint.request(&self.http, Grant::Refresh(&*tokens)).await?;
        debug!(expires_at = %refreshed.expires_at, "refreshed gmail access token");
        *tokens = refreshed;

        self.token_store
            .save_tokens(&tokens)
            .await
            .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;
        Ok(tokens.access_token.clone())
    }
}

fn full_format() -> [(&'static str, String); 1] {
    [("format", "full".to_string())]
}

fn outgoing(raw: &str, thread_id: Option<&str>) -> SendMessageRequest {
    SendMessageRequest {
        raw: raw.to_string(),
        thread_id: thread_id.map(str::to_string),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GmailClientError> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::oauth::NoopTokenStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Keeps every saved token; optionally refuses to save.
    #[derive(Default)]
    struct MemoryStore {
        saved: std::sync::Mutex<Vec<OAuthTokens>>,
        read_only: bool,
    }

    #[async_trait]
    impl TokenStore for MemoryStore {
        type Error = std::io::Error;

        async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
            if self.read_only {
                return Err(std::io::Error::other("token file is read-only"));
            }
            self.saved.lock().unwrap().push(tokens.clone());
            Ok(())
        }
    }

    fn tokens(access: &str, valid_for: Duration) -> OAuthTokens {
        OAuthTokens {
            access_token: access.into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + valid_for,
        }
    }

    fn client_with<S: TokenStore>(
        server: &MockServer,
        tokens: OAuthTokens,
        store: Arc<S>,
    ) -> GmailClient<S> {
        GmailClient::new(Client::new(), "me", "client", "secret", tokens, store)
            .with_api_base(format!("{}/gmail/v1/users", server.uri()))
            .with_token_endpoint(format!("{}/token", server.uri()))
    }

    fn client(server: &MockServer) -> GmailClient<NoopTokenStore> {
        client_with(
            server,
            tokens("token", Duration::hours(1)),
            Arc::new(NoopTokenStore),
        )
    }

    async fn mount_token_endpoint(server: &MockServer, access_token: &str) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": access_token,
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_saved_first() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "renewed").await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .and(header("authorization", "Bearer renewed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "emailAddress": "me@example.com",
                "messagesTotal": 10
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let gmail = client_with(&server, tokens("old", Duration::minutes(2)), store.clone());

        let profile = gmail.get_profile().await.expect("profile");
        assert_eq!(profile.email_address, "me@example.com");

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].access_token, "renewed");
        assert_eq!(saved[0].refresh_token, "refresh");
    }

    #[tokio::test]
    async fn concurrent_rejections_share_one_refresh() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "renewed").await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        for id in ["m1", "m2"] {
            Mock::given(method("GET"))
                .and(path(format!("/gmail/v1/users/me/messages/{id}")))
                .and(header("authorization", "Bearer renewed"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": id })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let gmail = client_with(
            &server,
            tokens("revoked", Duration::hours(1)),
            Arc::new(MemoryStore::default()),
        );

        let (first, second) = tokio::join!(gmail.get_message("m1"), gmail.get_message("m2"));
        assert_eq!(first.expect("m1").id, "m1");
        assert_eq!(second.expect("m2").id, "m2");
    }

    #[tokio::test]
    async fn second_rejection_is_reported_as_unauthorized() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "renewed").await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/threads/t1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let gmail = client_with(
            &server,
            tokens("revoked", Duration::hours(1)),
            Arc::new(MemoryStore::default()),
        );

        let err = gmail.get_thread("t1").await.expect_err("unauthorized");
        assert!(matches!(err, GmailClientError::Unauthorized));
    }

    #[tokio::test]
    async fn failing_token_store_fails_the_call() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "renewed").await;

        let store = Arc::new(MemoryStore {
            read_only: true,
            ..MemoryStore::default()
        });
        let gmail = client_with(&server, tokens("old", -Duration::seconds(1)), store);

        match gmail.get_message("m1").await {
            Err(GmailClientError::TokenStore(msg)) => assert!(msg.contains("read-only")),
            other => panic!("expected token store error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_params_become_query_pairs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/threads"))
            .and(query_param("q", "from:bob"))
            .and(query_param("labelIds", "INBOX"))
            .and(query_param("labelIds", "UNREAD"))
            .and(query_param("pageToken", "p2"))
            .and(query_param("includeSpamTrash", "true"))
            .and(query_param("maxResults", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "threads": [{ "id": "t1", "snippet": "hi" }],
                "nextPageToken": "p3"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let labels = ["INBOX".to_string(), "UNREAD".to_string()];
        let page = client(&server)
            .list_threads(ListParams {
                q: Some("from:bob"),
                label_ids: &labels,
                page_token: Some("p2"),
                include_spam_trash: true,
                max_results: Some(50),
            })
            .await
            .expect("threads");

        assert_eq!(page.threads[0].id, "t1");
        assert_eq!(page.next_page_token.as_deref(), Some("p3"));
    }

    #[test]
    fn default_list_params_add_nothing() {
        assert!(ListParams::default().to_query().is_empty());
    }

    #[tokio::test]
    async fn reply_and_draft_bodies_carry_raw_and_thread() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/send"))
            .and(body_json(json!({ "raw": "cmF3", "threadId": "t1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sent-1",
                "threadId": "t1",
                "labelIds": ["SENT"]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/drafts"))
            .and(body_partial_json(json!({ "message": { "raw": "cmF3" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d1",
                "message": { "id": "m9", "threadId": "t9" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gmail = client(&server);
        let sent = gmail.send_message("cmF3", Some("t1")).await.expect("sent");
        assert_eq!(sent.label_ids, ["SENT"]);

        let draft = gmail.create_draft("cmF3", None).await.expect("draft");
        assert_eq!((draft.id.as_str(), draft.message.id.as_str()), ("d1", "m9"));
    }

    #[tokio::test]
    async fn mark_read_sends_only_removed_labels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/m1/modify"))
            .and(body_json(json!({ "removeLabelIds": ["UNREAD"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m1",
                "labelIds": ["INBOX"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let updated = client(&server)
            .modify_message("m1", &[], &["UNREAD".to_string()])
            .await
            .expect("modified");
        assert_eq!(updated.label_ids, ["INBOX"]);
    }

    #[tokio::test]
    async fn http_and_decode_failures_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let gmail = client(&server);
        match gmail.get_message("gone").await {
            Err(GmailClientError::Http(err)) => {
                assert_eq!(err.status(), Some(StatusCode::NOT_FOUND))
            }
            other => panic!("expected http error, got {other:?}"),
        }
        assert!(matches!(
            gmail.list_labels().await,
            Err(GmailClientError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn signature_attachment_and_label_delete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/settings/sendAs/me@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sendAsEmail": "me@example.com",
                "signature": "<b>Me</b>"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1/attachments/a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "size": 5,
                "data": "aGVsbG8"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/gmail/v1/users/me/labels/Label_7"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let gmail = client(&server);
        let alias = gmail.get_send_as("me@example.com").await.expect("send-as");
        assert_eq!(alias.signature, "<b>Me</b>");

        let body = gmail.get_attachment("m1", "a1").await.expect("attachment");
        assert_eq!((body.size, body.data.as_deref()), (5, Some("aGVsbG8")));

        gmail.delete_label("Label_7").await.expect("deleted");
    }
}
