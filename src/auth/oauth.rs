use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::AuthError;
use crate::utils::env::env_var;

type Result<T> = std::result::Result<T, AuthError>;

/// Tokens are refreshed this long before the upstream says they expire.
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const MAX_ERROR_BODY_CHARS: usize = 2048;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GCE_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const IBM_IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

#[derive(Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

impl OAuthToken {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expires_in: None,
            scope: None,
        }
    }

    pub fn authorization_header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Anything that can mint an access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_token(&self, http: &reqwest::Client) -> Result<OAuthToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

async fn post_token_form(
    http: &reqwest::Client,
    url: &str,
    params: &[(String, String)],
    headers: &[(&str, &str)],
) -> Result<OAuthToken> {
    let mut req = http.post(url).form(params);
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    parse_token_response(req.send().await?).await
}

async fn parse_token_response(response: reqwest::Response) -> Result<OAuthToken> {
    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY_CHARS {
            let mut cut = MAX_ERROR_BODY_CHARS;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push_str("...(truncated)");
        }
        return Err(AuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }
    let parsed = response.json::<TokenResponse>().await?;
    let access_token = parsed
        .access_token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| AuthError::Invalid("token response missing access_token".to_string()))?;
    let token_type = parsed
        .token_type
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            if value.eq_ignore_ascii_case("bearer") {
                "Bearer".to_string()
            } else {
                value
            }
        })
        .unwrap_or_else(|| "Bearer".to_string());

    Ok(OAuthToken {
        access_token,
        token_type,
        expires_in: parsed.expires_in,
        scope: parsed.scope,
    })
}

#[derive(Clone)]
pub struct OAuthClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
    pub audience: Option<String>,
    pub extra_params: BTreeMap<String, String>,
}

impl std::fmt::Debug for OAuthClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let extra_param_keys: Vec<&str> =
            self.extra_params.keys().map(|key| key.as_str()).collect();
        f.debug_struct("OAuthClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .field("audience", &self.audience)
            .field("extra_params", &extra_param_keys)
            .finish()
    }
}

impl OAuthClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let token_url = token_url.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        if token_url.trim().is_empty() {
            return Err(AuthError::Missing("oauth token_url".to_string()));
        }
        if client_id.trim().is_empty() {
            return Err(AuthError::Missing("oauth client_id".to_string()));
        }
        if client_secret.trim().is_empty() {
            return Err(AuthError::Missing("oauth client_secret".to_string()));
        }

        Ok(Self {
            token_url,
            client_id,
            client_secret,
            scope: None,
            audience: None,
            extra_params: BTreeMap::new(),
        })
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_extra_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl TokenSource for OAuthClientCredentials {
    fn name(&self) -> &str {
        "oauth_client_credentials"
    }

    async fn fetch_token(&self, http: &reqwest::Client) -> Result<OAuthToken> {
        let mut params = Vec::<(String, String)>::new();
        params.push(("grant_type".to_string(), "client_credentials".to_string()));
        params.push(("client_id".to_string(), self.client_id.clone()));
        params.push(("client_secret".to_string(), self.client_secret.clone()));
        if let Some(scope) = self.scope.as_ref().filter(|s| !s.trim().is_empty()) {
            params.push(("scope".to_string(), scope.clone()));
        }
        if let Some(audience) = self.audience.as_ref().filter(|s| !s.trim().is_empty()) {
            params.push(("audience".to_string(), audience.clone()));
        }
        for (key, value) in &self.extra_params {
            if key.trim().is_empty() {
                continue;
            }
            params.push((key.clone(), value.clone()));
        }
        post_token_form(http, &self.token_url, &params, &[]).await
    }
}

/// A pre-issued token that never refreshes.
#[derive(Clone)]
pub struct StaticToken(pub String);

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_token(&self, _http: &reqwest::Client) -> Result<OAuthToken> {
        Ok(OAuthToken::bearer(self.0.clone()))
    }
}

#[derive(Clone, Deserialize)]
struct AuthorizedUserFile {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    refresh_token: String,
}

/// Google Application Default Credentials.
///
/// Resolution order: an `authorized_user` credentials file (refresh-token grant),
/// then the GCE metadata server. Service-account key files are not supported because
/// they require RS256 JWT signing.
#[derive(Clone, Debug)]
pub struct GoogleAdcSource {
    credentials_file: Option<PathBuf>,
    token_url: String,
    metadata_url: String,
    scope: String,
}

impl Default for GoogleAdcSource {
    fn default() -> Self {
        Self {
            credentials_file: env_var("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            metadata_url: GCE_METADATA_TOKEN_URL.to_string(),
            scope: "https://www.googleapis.com/auth/cloud-platform".to_string(),
        }
    }
}

impl GoogleAdcSource {
    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn with_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = url.into();
        self
    }

    async fn from_authorized_user(
        &self,
        http: &reqwest::Client,
        file: AuthorizedUserFile,
    ) -> Result<OAuthToken> {
        if file.refresh_token.trim().is_empty() {
            return Err(AuthError::Invalid(
                "authorized_user credentials missing refresh_token".to_string(),
            ));
        }
        let params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("client_id".to_string(), file.client_id),
            ("client_secret".to_string(), file.client_secret),
            ("refresh_token".to_string(), file.refresh_token),
        ];
        post_token_form(http, &self.token_url, &params, &[]).await
    }

    async fn from_metadata_server(&self, http: &reqwest::Client) -> Result<OAuthToken> {
        let response = http
            .get(&self.metadata_url)
            .query(&[("scopes", self.scope.as_str())])
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        parse_token_response(response).await
    }
}

#[async_trait]
impl TokenSource for GoogleAdcSource {
    fn name(&self) -> &str {
        "google_adc"
    }

    async fn fetch_token(&self, http: &reqwest::Client) -> Result<OAuthToken> {
        if let Some(path) = self.credentials_file.as_ref() {
            let raw = tokio::fs::read_to_string(path).await?;
            let file: AuthorizedUserFile = serde_json::from_str(&raw)?;
            return match file.kind.as_str() {
                "authorized_user" => self.from_authorized_user(http, file).await,
                other => Err(AuthError::Invalid(format!(
                    "unsupported google credentials type {other:?}"
                ))),
            };
        }
        self.from_metadata_server(http).await
    }
}

/// IBM Cloud IAM API-key exchange used by watsonx.
#[derive(Clone)]
pub struct IbmIamSource {
    api_key: String,
    token_url: String,
}

impl std::fmt::Debug for IbmIamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbmIamSource")
            .field("api_key", &"<redacted>")
            .field("token_url", &self.token_url)
            .finish()
    }
}

impl IbmIamSource {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            token_url: IBM_IAM_TOKEN_URL.to_string(),
        }
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }
}

#[async_trait]
impl TokenSource for IbmIamSource {
    fn name(&self) -> &str {
        "ibm_iam"
    }

    async fn fetch_token(&self, http: &reqwest::Client) -> Result<OAuthToken> {
        let params = vec![
            (
                "grant_type".to_string(),
                "urn:ibm:params:oauth:grant-type:apikey".to_string(),
            ),
            ("apikey".to_string(), self.api_key.clone()),
        ];
        post_token_form(http, &self.token_url, &params, &[("accept", "application/json")]).await
    }
}

struct CachedEntry {
    token: OAuthToken,
    refresh_at: Instant,
}

/// Caches a source's token until shortly before expiry.
///
/// Readers share the lock; a refresh takes the write lock and re-checks so that
/// concurrent callers trigger at most one upstream token request.
pub struct CachedToken {
    source: Box<dyn TokenSource>,
    entry: RwLock<Option<CachedEntry>>,
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("source", &self.source.name())
            .finish()
    }
}

impl CachedToken {
    pub fn new(source: impl TokenSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            entry: RwLock::new(None),
        }
    }

    pub async fn get(&self, http: &reqwest::Client) -> Result<OAuthToken> {
        {
            let guard = self.entry.read().await;
            if let Some(entry) = guard.as_ref().filter(|entry| Instant::now() < entry.refresh_at) {
                return Ok(entry.token.clone());
            }
        }

        let mut guard = self.entry.write().await;
        if let Some(entry) = guard.as_ref().filter(|entry| Instant::now() < entry.refresh_at) {
            return Ok(entry.token.clone());
        }

        let token = self.source.fetch_token(http).await?;
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_SKEW);
        tracing::debug!(source = self.source.name(), ?lifetime, "refreshed upstream token");
        *guard = Some(CachedEntry {
            token: token.clone(),
            refresh_at,
        });
        Ok(token)
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, Method::POST, MockServer};
    use std::io::Write;

    #[tokio::test]
    async fn fetches_oauth_token_via_http() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_includes("grant_type=client_credentials")
                    .body_includes("client_id=test-client")
                    .body_includes("client_secret=secret");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"tok-123","token_type":"Bearer","expires_in":3600}"#);
            })
            .await;

        let http = reqwest::Client::new();
        let oauth = OAuthClientCredentials::new(server.url("/token"), "test-client", "secret")?;
        let token = oauth.fetch_token(&http).await?;
        mock.assert_async().await;

        assert_eq!(token.access_token, "tok-123");
        assert_eq!(token.token_type, "Bearer");
        Ok(())
    }

    #[tokio::test]
    async fn cached_token_hits_endpoint_once() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/identity/token")
                    .body_includes("apikey=ibm-key");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"iam-tok","token_type":"Bearer","expires_in":3600}"#);
            })
            .await;

        let http = reqwest::Client::new();
        let cached = CachedToken::new(
            IbmIamSource::new("ibm-key").with_token_url(server.url("/identity/token")),
        );
        let first = cached.get(&http).await?;
        let second = cached.get(&http).await?;
        mock.assert_calls_async(1).await;
        assert_eq!(first.access_token, "iam-tok");
        assert_eq!(second.authorization_header_value(), "Bearer iam-tok");
        Ok(())
    }

    #[tokio::test]
    async fn short_lived_tokens_refresh_inside_skew() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"short","expires_in":10}"#);
            })
            .await;

        let http = reqwest::Client::new();
        let cached = CachedToken::new(OAuthClientCredentials::new(
            server.url("/token"),
            "id",
            "secret",
        )?);
        cached.get(&http).await?;
        cached.get(&http).await?;
        mock.assert_calls_async(2).await;
        Ok(())
    }

    #[tokio::test]
    async fn adc_authorized_user_uses_refresh_token_grant() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_includes("grant_type=refresh_token")
                    .body_includes("refresh_token=rt-1");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"ya29.adc","expires_in":3599,"token_type":"Bearer"}"#);
            })
            .await;

        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"type":"authorized_user","client_id":"cid","client_secret":"cs","refresh_token":"rt-1"}}"#
        )?;

        let source = GoogleAdcSource::default()
            .with_credentials_file(file.path())
            .with_token_url(server.url("/token"));
        let token = source.fetch_token(&reqwest::Client::new()).await?;
        mock.assert_async().await;
        assert_eq!(token.access_token, "ya29.adc");
        Ok(())
    }

    #[tokio::test]
    async fn adc_falls_back_to_metadata_server() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/metadata/token")
                    .header("Metadata-Flavor", "Google");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"gce-tok","expires_in":300,"token_type":"Bearer"}"#);
            })
            .await;

        let source = GoogleAdcSource {
            credentials_file: None,
            ..GoogleAdcSource::default()
        }
        .with_metadata_url(server.url("/metadata/token"));
        let token = source.fetch_token(&reqwest::Client::new()).await?;
        mock.assert_async().await;
        assert_eq!(token.access_token, "gce-tok");
        Ok(())
    }

    #[tokio::test]
    async fn token_endpoint_errors_keep_status() {
        if crate::utils::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(401).body("bad client");
            })
            .await;
        let oauth = OAuthClientCredentials::new(server.url("/token"), "id", "secret").unwrap();
        let err = oauth.fetch_token(&reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenEndpoint { status: 401, .. }));
    }
}
