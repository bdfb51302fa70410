//! Typed client for the marketplace REST API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use listsync_core::truncate_utf8;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::taxonomy::ListingPayload;

const ERROR_BODY_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("marketplace transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("marketplace {endpoint} returned {status}: {body}")]
    Status {
        status: u16,
        endpoint: String,
        body: String,
    },
    #[error("marketplace rejected {endpoint}: {message}")]
    Rejected { endpoint: String, message: String },
    #[error("decoding marketplace {endpoint} response: {message}")]
    Decode { endpoint: String, message: String },
}

impl MarketError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The remote answered 404; the listing is gone either way.
    AlreadyGone,
}

/// The remote operations the engine depends on.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// Creates a listing and returns its remote id.
    async fn create_listing(&self, payload: &ListingPayload) -> Result<i64, MarketError>;

    /// Attaches one photo. Photos show in upload order; the first is primary.
    async fn upload_image(
        &self,
        listing_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), MarketError>;

    async fn delete_listing(&self, listing_id: i64) -> Result<DeleteOutcome, MarketError>;

    /// First geo id whose name matches, if any.
    async fn find_city(&self, name: &str) -> Result<Option<i64>, MarketError>;
}

#[derive(Debug, Clone)]
pub struct MarketClientConfig {
    pub base_url: String,
    pub secret: String,
    pub key_id: String,
    pub token_ttl: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for MarketClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.truckmarket.example".to_string(),
            secret: String::new(),
            key_id: String::new(),
            token_ttl: Duration::from_secs(40 * 60),
            timeout: Duration::from_secs(20),
            user_agent: Some("listsync-bot/0.1".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    obtained_at: Instant,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    success: bool,
    #[serde(default)]
    data: Option<CreatedListing>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct CreatedListing {
    id: i64,
}

#[derive(Deserialize)]
struct GeoResponse {
    #[serde(default)]
    data: Vec<GeoRegion>,
}

#[derive(Deserialize)]
struct GeoRegion {
    id: i64,
}

pub struct MarketClient {
    http: reqwest::Client,
    config: MarketClientConfig,
    token: Mutex<Option<CachedToken>>,
}

impl MarketClient {
    pub fn new(config: MarketClientConfig) -> Result<Self, MarketError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(ua) = &config.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        Ok(Self {
            http: builder.build()?,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Cached bearer token, re-authenticating once the TTL has passed.
    async fn token(&self) -> Result<String, MarketError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.obtained_at.elapsed() < self.config.token_ttl {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(self.url("auth"))
            .json(&json!({ "secret": self.config.secret, "keyId": self.config.key_id }))
            .send()
            .await?;
        let auth: AuthResponse = decode_json("auth", ensure_success("auth", response).await?).await?;
        info!("marketplace token refreshed");
        *cached = Some(CachedToken {
            value: auth.token.clone(),
            obtained_at: Instant::now(),
        });
        Ok(auth.token)
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    /// Sends an authorized request. A 401 invalidates the token and the
    /// request is rebuilt and sent exactly once more.
    async fn send_authorized<F>(&self, endpoint: &str, build: F) -> Result<Response, MarketError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let token = self.token().await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(endpoint, "marketplace token rejected; re-authenticating");
        self.invalidate_token().await;
        let token = self.token().await?;
        Ok(build(&self.http).bearer_auth(&token).send().await?)
    }
}

#[async_trait]
impl MarketplaceApi for MarketClient {
    async fn create_listing(&self, payload: &ListingPayload) -> Result<i64, MarketError> {
        let endpoint = "listings/create";
        let url = self.url(endpoint);
        let response = self
            .send_authorized(endpoint, |http| http.post(&url).json(payload))
            .await?;
        let created: CreateResponse =
            decode_json(endpoint, ensure_success(endpoint, response).await?).await?;

        match (created.success, created.data) {
            (true, Some(data)) => {
                debug!(remote_id = data.id, "marketplace listing created");
                Ok(data.id)
            }
            (true, None) => Err(MarketError::Decode {
                endpoint: endpoint.to_string(),
                message: "success without data.id".to_string(),
            }),
            (false, _) => Err(MarketError::Rejected {
                endpoint: endpoint.to_string(),
                message: created
                    .message
                    .unwrap_or_else(|| "success=false".to_string()),
            }),
        }
    }

    async fn upload_image(
        &self,
        listing_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), MarketError> {
        let endpoint = format!("listings/images/{listing_id}");
        let url = self.url(&endpoint);
        let response = self
            .send_authorized(&endpoint, |http| {
                let part = Part::bytes(bytes.clone()).file_name(file_name.to_string());
                http.post(&url).multipart(Form::new().part("file", part))
            })
            .await?;
        ensure_success(&endpoint, response).await?;
        Ok(())
    }

    async fn delete_listing(&self, listing_id: i64) -> Result<DeleteOutcome, MarketError> {
        let endpoint = format!("listings/delete/{listing_id}");
        let url = self.url(&endpoint);
        let response = self
            .send_authorized(&endpoint, |http| http.delete(&url))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            info!(remote_id = listing_id, "marketplace listing already gone");
            return Ok(DeleteOutcome::AlreadyGone);
        }
        ensure_success(&endpoint, response).await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn find_city(&self, name: &str) -> Result<Option<i64>, MarketError> {
        let endpoint = "geo/regions/list";
        let url = self.url(endpoint);
        let body = json!({ "filter": { "name": name } });
        let response = self
            .send_authorized(endpoint, |http| http.post(&url).json(&body))
            .await?;
        let geo: GeoResponse = decode_json(endpoint, ensure_success(endpoint, response).await?).await?;
        Ok(geo.data.first().map(|region| region.id))
    }
}

async fn ensure_success(endpoint: &str, response: Response) -> Result<Response, MarketError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MarketError::Status {
        status: status.as_u16(),
        endpoint: endpoint.to_string(),
        body: truncate_utf8(&body, ERROR_BODY_BYTES).to_string(),
    })
}

async fn decode_json<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, MarketError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| MarketError::Decode {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::extract::{Multipart, Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct MockMarket {
        auth_calls: AtomicUsize,
        reject_next: AtomicUsize,
        created: StdMutex<Vec<Value>>,
        uploads: StdMutex<Vec<(i64, String, String, Vec<u8>)>>,
        deleted: StdMutex<Vec<i64>>,
    }

    type Shared = Arc<MockMarket>;

    fn unauthorized(state: &MockMarket, headers: &HeaderMap) -> Option<AxumResponse> {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let forced = state
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced || !bearer.starts_with("Bearer tok-") {
            return Some((AxumStatus::UNAUTHORIZED, "expired").into_response());
        }
        None
    }

    async fn auth(State(state): State<Shared>, Json(body): Json<Value>) -> AxumResponse {
        if body["secret"] != "s3cret" || body["keyId"] != "key-1" {
            return (AxumStatus::FORBIDDEN, "bad credentials").into_response();
        }
        let n = state.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({ "token": format!("tok-{n}") })).into_response()
    }

    async fn create(
        State(state): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        if let Some(denied) = unauthorized(&state, &headers) {
            return denied;
        }
        if body["brand"].is_null() {
            return Json(json!({ "success": false, "message": "brand required" })).into_response();
        }
        state.created.lock().unwrap().push(body);
        Json(json!({ "success": true, "data": { "id": 555 } })).into_response()
    }

    async fn upload(
        State(state): State<Shared>,
        Path(id): Path<i64>,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> AxumResponse {
        if let Some(denied) = unauthorized(&state, &headers) {
            return denied;
        }
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.unwrap().to_vec();
            state.uploads.lock().unwrap().push((id, name, file_name, data));
        }
        Json(json!({ "success": true })).into_response()
    }

    async fn remove(
        State(state): State<Shared>,
        Path(id): Path<i64>,
        headers: HeaderMap,
    ) -> AxumResponse {
        if let Some(denied) = unauthorized(&state, &headers) {
            return denied;
        }
        match id {
            404 => (AxumStatus::NOT_FOUND, "no such listing").into_response(),
            500 => (AxumStatus::INTERNAL_SERVER_ERROR, "db down").into_response(),
            _ => {
                state.deleted.lock().unwrap().push(id);
                Json(json!({ "success": true })).into_response()
            }
        }
    }

    async fn geo(
        State(state): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        if let Some(denied) = unauthorized(&state, &headers) {
            return denied;
        }
        let data = match body["filter"]["name"].as_str() {
            Some("Київ") => json!([{ "id": 7 }, { "id": 9 }]),
            _ => json!([]),
        };
        Json(json!({ "data": data })).into_response()
    }

    async fn spawn_mock(state: Shared) -> String {
        let app = Router::new()
            .route("/auth", post(auth))
            .route("/listings/create", post(create))
            .route("/listings/images/{id}", post(upload))
            .route("/listings/delete/{id}", delete(remove))
            .route("/geo/regions/list", post(geo))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: String, token_ttl: Duration) -> MarketClient {
        MarketClient::new(MarketClientConfig {
            base_url,
            secret: "s3cret".to_string(),
            key_id: "key-1".to_string(),
            token_ttl,
            timeout: Duration::from_secs(5),
            user_agent: None,
        })
        .unwrap()
    }

    fn payload() -> ListingPayload {
        ListingPayload {
            brand: Some(1117),
            price: Some(12_300),
            description: "Вантажівка".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn token_is_cached_across_calls() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));

        assert_eq!(client.create_listing(&payload()).await.unwrap(), 555);
        assert_eq!(client.create_listing(&payload()).await.unwrap(), 555);

        assert_eq!(state.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.created.lock().unwrap().len(), 2);
        assert_eq!(state.created.lock().unwrap()[0]["brand"], 1117);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_use() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::ZERO);

        client.create_listing(&payload()).await.unwrap();
        client.create_listing(&payload()).await.unwrap();

        assert_eq!(state.auth_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_response_refreshes_token_and_retries_once() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));
        state.reject_next.store(1, Ordering::SeqCst);

        assert_eq!(client.create_listing(&payload()).await.unwrap(), 555);
        assert_eq!(state.auth_calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_unauthorized_response_propagates() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));
        state.reject_next.store(2, Ordering::SeqCst);

        let err = client.create_listing(&payload()).await.unwrap_err();
        assert!(err.is_unauthorized(), "{err}");
        assert_eq!(state.auth_calls.load(Ordering::SeqCst), 2);
        assert!(state.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_create_is_an_error() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));

        let err = client
            .create_listing(&ListingPayload::default())
            .await
            .unwrap_err();
        match err {
            MarketError::Rejected { message, .. } => assert_eq!(message, "brand required"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn delete_tolerates_not_found() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));

        assert_eq!(client.delete_listing(31).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(client.delete_listing(404).await.unwrap(), DeleteOutcome::AlreadyGone);
        let err = client.delete_listing(500).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(!err.is_not_found());
        assert_eq!(*state.deleted.lock().unwrap(), vec![31]);
    }

    #[tokio::test]
    async fn geo_lookup_uses_first_match() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));

        assert_eq!(client.find_city("Київ").await.unwrap(), Some(7));
        assert_eq!(client.find_city("Атлантида").await.unwrap(), None);
    }

    #[tokio::test]
    async fn images_upload_in_call_order_as_file_parts() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));

        client.upload_image(555, "000_a.jpg", b"first".to_vec()).await.unwrap();
        client.upload_image(555, "001_b.jpg", b"second".to_vec()).await.unwrap();

        let uploads = state.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0], (555, "file".into(), "000_a.jpg".into(), b"first".to_vec()));
        assert_eq!(uploads[1].2, "001_b.jpg");
    }

    #[tokio::test]
    async fn upload_retries_after_unauthorized() {
        let state = Shared::default();
        let client = client_for(spawn_mock(state.clone()).await, Duration::from_secs(60));
        state.reject_next.store(1, Ordering::SeqCst);

        client.upload_image(9, "000_a.jpg", b"img".to_vec()).await.unwrap();
        assert_eq!(state.uploads.lock().unwrap().len(), 1);
    }
}
