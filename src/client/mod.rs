//! Remote HTTP client shared by connectors.
//!
//! Every request goes through the client's own [`RateLimiter`] (one per
//! client, so different sources never contend) and is wrapped by its
//! [`RetryHandler`].

pub mod rate_limiter;
pub mod retry;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::HttpSettings;
use crate::error::HarvestError;
use crate::model::{AuthConfig, AuthType, SourceConfig};

pub use rate_limiter::RateLimiter;
pub use retry::RetryHandler;

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";
const MAX_ERROR_BODY: usize = 512;

pub struct ApiClient {
    source_id: String,
    http: reqwest::Client,
    base_url: Url,
    auth: Option<AuthConfig>,
    headers: HeaderMap,
    limiter: RateLimiter,
    retry: RetryHandler,
}

impl ApiClient {
    /// Builds the client for a source from its `connection` block.
    ///
    /// # Errors
    ///
    /// [`HarvestError::MissingBaseUrl`] when the source has no base URL, or a
    /// URL/header/TLS setup error.
    pub fn from_source(
        source: &SourceConfig,
        settings: &HttpSettings,
    ) -> Result<Self, HarvestError> {
        let connection = source.connection.clone().unwrap_or_default();
        let base = source
            .base_url()
            .ok_or_else(|| HarvestError::MissingBaseUrl(source.id.clone()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &connection.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HarvestError::InvalidParams(format!("header '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HarvestError::InvalidParams(format!("header value: {}", e)))?;
            headers.insert(name, value);
        }

        let timeout = Duration::from_millis(connection.timeout_ms.unwrap_or(settings.timeout_ms));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.as_str())
            .build()?;

        Ok(Self {
            source_id: source.id.clone(),
            http,
            base_url: normalize_base(base)?,
            auth: connection.auth.clone(),
            headers,
            limiter: RateLimiter::from_config(connection.rate_limit.as_ref()),
            retry: connection
                .retry
                .as_ref()
                .map(RetryHandler::from_config)
                .unwrap_or_default(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL. Absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> Result<Url, HarvestError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(Url::parse(path)?);
        }
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Applies the source's authentication and static headers.
    pub fn authorize(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req.headers(self.headers.clone());
        let Some(auth) = &self.auth else {
            return req;
        };
        let Some(credential) = auth.credential.as_deref() else {
            return req;
        };
        match auth.auth_type {
            AuthType::None => req,
            AuthType::Bearer => req.bearer_auth(credential),
            AuthType::ApiKey => {
                let header = auth.header.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER);
                req.header(header, credential)
            }
            AuthType::Basic => match credential.split_once(':') {
                Some((user, password)) => req.basic_auth(user, Some(password)),
                None => req.basic_auth(credential, None::<&str>),
            },
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, HarvestError> {
        self.request_json(Method::GET, path, query, None).await
    }

    /// Sends a request with rate limiting and retries, decoding a JSON body.
    /// An empty body decodes to `null`.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, HarvestError> {
        let url = self.url_for(path)?;
        self.retry
            .run(|| self.execute_once(method.clone(), &url, query, body))
            .await
    }

    async fn execute_once(
        &self,
        method: Method,
        url: &Url,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, HarvestError> {
        self.limiter.acquire().await;

        let mut req = self.authorize(self.http.request(method.clone(), url.clone()));
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        debug!(source_id = %self.source_id, method = %method, url = %url, "Sending request");
        let response = req.send().await?;
        let response = check_status(response).await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| HarvestError::UnexpectedResponse {
            source_id: self.source_id.clone(),
            message: format!("invalid JSON from {}: {}", url, e),
        })
    }
}

/// Maps 429 and other non-2xx responses to errors.
pub async fn check_status(response: Response) -> Result<Response, HarvestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(HarvestError::RateLimited { url, retry_after });
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(HarvestError::Transport {
        status: status.as_u16(),
        url,
        body,
    })
}

/// `Retry-After` is either delay-seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

fn normalize_base(base: &str) -> Result<Url, HarvestError> {
    if base.ends_with('/') {
        Ok(Url::parse(base)?)
    } else {
        Ok(Url::parse(&format!("{}/", base))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionConfig, RetryConfig};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(base_url: &str) -> SourceConfig {
        let mut source = SourceConfig::new("sirene", "Sirene", "insee");
        source.connection = Some(ConnectionConfig {
            base_url: Some(base_url.to_string()),
            auth: Some(AuthConfig {
                auth_type: AuthType::Bearer,
                credential: Some("tok".into()),
                header: None,
            }),
            retry: Some(RetryConfig {
                max_attempts: 3,
                delay_ms: 1,
                backoff_multiplier: 1.0,
            }),
            ..Default::default()
        });
        source
    }

    #[test]
    fn test_url_joining() {
        let client = ApiClient::from_source(
            &source("https://api.insee.fr/entreprises/sirene/V3"),
            &HttpSettings::default(),
        )
        .unwrap();
        assert_eq!(
            client.url_for("/siret/123").unwrap().as_str(),
            "https://api.insee.fr/entreprises/sirene/V3/siret/123"
        );
        assert_eq!(client.url_for("http://other/x").unwrap().as_str(), "http://other/x");
    }

    #[test]
    fn test_missing_base_url() {
        let s = SourceConfig::new("x", "x", "insee");
        assert!(matches!(
            ApiClient::from_source(&s, &HttpSettings::default()),
            Err(HarvestError::MissingBaseUrl(_))
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test]
    async fn test_get_json_sends_auth_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/siret"))
            .and(query_param("q", "codePostal:75001"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"etablissements": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ApiClient::from_source(&source(&server.uri()), &HttpSettings::default()).unwrap();
        let body = client
            .get_json("siret", &[("q".to_string(), "codePostal:75001".to_string())])
            .await
            .unwrap();
        assert_eq!(body, json!({"etablissements": []}));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client =
            ApiClient::from_source(&source(&server.uri()), &HttpSettings::default()).unwrap();
        let body = client.get_json("flaky", &[]).await.unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_not_found_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such siret"))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ApiClient::from_source(&source(&server.uri()), &HttpSettings::default()).unwrap();
        let err = client.get_json("missing", &[]).await.unwrap_err();
        match err {
            HarvestError::Transport { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such siret");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let client =
            ApiClient::from_source(&source(&server.uri()), &HttpSettings::default()).unwrap();
        let err = client.get_json("anything", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            HarvestError::RateLimited { retry_after: Some(d), .. } if d.is_zero()
        ));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }
}
