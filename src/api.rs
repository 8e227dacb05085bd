//! Cart API client.
//!
//! `CartApi` is the seam between the sync controller and the retailer-backed
//! cart service. `HttpCartApi` speaks the service's JSON envelope
//! (`{ success, data?, error? }`) over reqwest.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::CartError;
use crate::model::{AddItemRequest, CartItem, ClearScope, Modality};

/// Default timeout for cart API requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the sync controller needs from the cart service.
pub trait CartApi: Send + Sync + 'static {
    /// `GET /auth/status`
    fn auth_status(&self) -> impl Future<Output = Result<bool, CartError>> + Send;

    /// `GET /cart/view`
    fn view_cart(&self) -> impl Future<Output = Result<Vec<CartItem>, CartError>> + Send;

    /// `POST /cart/add`
    fn add_item(&self, item: &AddItemRequest) -> impl Future<Output = Result<(), CartError>> + Send;

    /// `POST /cart/remove`
    fn remove_item(&self, product_id: &str) -> impl Future<Output = Result<(), CartError>> + Send;

    /// `POST /cart/update-quantity`
    fn update_quantity(
        &self,
        product_id: &str,
        quantity: u32,
    ) -> impl Future<Output = Result<(), CartError>> + Send;

    /// `POST /cart/update-modality`
    fn update_modality(
        &self,
        product_id: &str,
        modality: Modality,
    ) -> impl Future<Output = Result<(), CartError>> + Send;

    /// `POST /cart/update-all-modality`
    fn update_all_modality(
        &self,
        modality: Modality,
    ) -> impl Future<Output = Result<(), CartError>> + Send;

    /// `POST /cart/clear` or `POST /cart/clear-local`
    fn clear(&self, scope: ClearScope) -> impl Future<Output = Result<(), CartError>> + Send;

    /// `POST /cart/import`
    fn import_items(
        &self,
        items: &[AddItemRequest],
    ) -> impl Future<Output = Result<(), CartError>> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the cart service base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> CartError {
    if err.is_connect() {
        return CartError::Network(format!("Cannot reach cart service at {url}"));
    }
    if err.is_timeout() {
        return CartError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return CartError::Config(format!("Invalid cart service URL: {url}"));
    }
    CartError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        403 => "Cart access not permitted for this account".to_string(),
        404 => "Cart endpoint not found".to_string(),
        s if s >= 500 => format!("Cart service error (HTTP {s})"),
        s => format!("Unexpected response from cart service (HTTP {s})"),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CartViewData {
    #[serde(default)]
    cart_items: Vec<CartItem>,
}

#[derive(Debug, Deserialize)]
struct AuthStatusData {
    #[serde(default)]
    authenticated: bool,
}

/// Turn a status + body into the envelope's `data`.
///
/// 401 maps to `AuthRequired`; other non-2xx statuses keep the server's
/// `error`/`message` text when it sent one. A 2xx with `success: false`
/// becomes `Rejected`.
fn interpret_response<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
) -> Result<Option<T>, CartError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(CartError::AuthRequired);
    }

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| {
                json.get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| status_message(status));
        return Err(CartError::http(status, message));
    }

    if body.trim().is_empty() {
        return Err(CartError::Decode("empty response body".into()));
    }
    let envelope: Envelope<T> =
        serde_json::from_str(body).map_err(|e| CartError::Decode(e.to_string()))?;
    if !envelope.success {
        let error = envelope
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "request was not successful".to_string());
        if is_auth_failure_message(&error) {
            return Err(CartError::AuthRequired);
        }
        return Err(CartError::Rejected(error));
    }
    Ok(envelope.data)
}

/// The service reports a missing/expired retailer token inside a 200 body.
fn is_auth_failure_message(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("not authenticated")
        || lower.contains("authentication required")
        || lower.contains("token expired")
        || lower.contains("no access token")
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpCartApi {
    base_url: String,
    client: Client,
}

impl HttpCartApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CartError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CartError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, CartError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "cart api GET");
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        interpret_response(status, &body)
    }

    async fn post(&self, path: &str, body: Value) -> Result<(), CartError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "cart api POST");
        let resp = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        interpret_response::<Value>(status, &text).map(|_| ())
    }
}

impl CartApi for HttpCartApi {
    async fn auth_status(&self) -> Result<bool, CartError> {
        match self.get::<AuthStatusData>("/auth/status").await {
            Ok(data) => Ok(data.map(|d| d.authenticated).unwrap_or(false)),
            Err(CartError::AuthRequired) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn view_cart(&self) -> Result<Vec<CartItem>, CartError> {
        let data = self.get::<CartViewData>("/cart/view").await?;
        Ok(data.map(|d| d.cart_items).unwrap_or_default())
    }

    async fn add_item(&self, item: &AddItemRequest) -> Result<(), CartError> {
        self.post(
            "/cart/add",
            json!({
                "product_id": item.product_id,
                "quantity": item.quantity,
                "modality": item.modality,
            }),
        )
        .await
    }

    async fn remove_item(&self, product_id: &str) -> Result<(), CartError> {
        self.post("/cart/remove", json!({ "product_id": product_id }))
            .await
    }

    async fn update_quantity(&self, product_id: &str, quantity: u32) -> Result<(), CartError> {
        self.post(
            "/cart/update-quantity",
            json!({ "product_id": product_id, "quantity": quantity }),
        )
        .await
    }

    async fn update_modality(&self, product_id: &str, modality: Modality) -> Result<(), CartError> {
        self.post(
            "/cart/update-modality",
            json!({ "product_id": product_id, "modality": modality }),
        )
        .await
    }

    async fn update_all_modality(&self, modality: Modality) -> Result<(), CartError> {
        self.post("/cart/update-all-modality", json!({ "modality": modality }))
            .await
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), CartError> {
        let path = match scope {
            ClearScope::Remote => "/cart/clear",
            ClearScope::LocalOnly => "/cart/clear-local",
        };
        self.post(path, json!({})).await
    }

    async fn import_items(&self, items: &[AddItemRequest]) -> Result<(), CartError> {
        self.post("/cart/import", json!({ "items": items })).await
    }
}
