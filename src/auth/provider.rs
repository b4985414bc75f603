//! Cached bearer token with single-flight refresh

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::TokenStore;
use crate::error::TokenError;
use crate::{Error, Result};

/// Store slot the token is persisted under
pub const TOKEN_SLOT: &str = "jwt_token";

/// Auth response field holding the token
pub const TOKEN_FIELD: &str = "id_token";

type Refresh = Shared<BoxFuture<'static, std::result::Result<String, TokenError>>>;

/// Obtains and caches the bearer token for the speech endpoint
///
/// A cached token is returned as-is: there is no expiry check, and it stays
/// valid until [`TokenProvider::invalidate`] clears it.
pub struct TokenProvider {
    client: reqwest::Client,
    auth_url: Url,
    store: Arc<dyn TokenStore>,
    // Every caller arriving during a refresh awaits this same outcome
    in_flight: Mutex<Option<Refresh>>,
}

impl TokenProvider {
    /// Create a provider for the given auth endpoint
    ///
    /// # Errors
    ///
    /// Returns error if `auth_url` is not a valid URL
    pub fn new(client: reqwest::Client, auth_url: &str, store: Arc<dyn TokenStore>) -> Result<Self> {
        let auth_url = Url::parse(auth_url)
            .map_err(|e| Error::Config(format!("invalid auth url {auth_url}: {e}")))?;

        Ok(Self {
            client,
            auth_url,
            store,
            in_flight: Mutex::new(None),
        })
    }

    /// Return the cached token, refreshing it if none is stored
    ///
    /// At most one refresh is in flight; callers arriving during a refresh
    /// receive its result, success or failure.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or the refresh fails
    pub async fn get_valid_token(&self) -> std::result::Result<String, TokenError> {
        if let Some(token) = self.store.get(TOKEN_SLOT)? {
            tracing::trace!("token cache hit");
            return Ok(token);
        }

        self.shared_refresh(true).await
    }

    /// Request a new token from the auth endpoint and persist it
    ///
    /// Joins a refresh that is already in flight instead of starting another.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NetworkError`] on transport failure
    /// - [`TokenError::InvalidResponse`] on a non-200 status or non-JSON body
    /// - [`TokenError::MissingToken`] if the body has no token field
    pub async fn refresh_token(&self) -> std::result::Result<String, TokenError> {
        self.shared_refresh(false).await
    }

    async fn shared_refresh(&self, reuse_cached: bool) -> std::result::Result<String, TokenError> {
        let refresh = {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|e| TokenError::Storage(e.to_string()))?;

            if let Some(refresh) = in_flight.as_ref() {
                tracing::debug!("joining in-flight token refresh");
                refresh.clone()
            } else {
                // A refresh may have landed since the cache was checked
                if reuse_cached {
                    if let Some(token) = self.store.get(TOKEN_SLOT)? {
                        return Ok(token);
                    }
                }
                let refresh = request_token(
                    self.client.clone(),
                    self.auth_url.clone(),
                    Arc::clone(&self.store),
                )
                .boxed()
                .shared();
                *in_flight = Some(refresh.clone());
                refresh
            }
        };

        let result = refresh.clone().await;

        if let Ok(mut in_flight) = self.in_flight.lock() {
            if in_flight
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&refresh))
            {
                *in_flight = None;
            }
        }
        result
    }

    /// Drop the cached token so the next call refreshes
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    pub fn invalidate(&self) -> std::result::Result<(), TokenError> {
        self.store.remove(TOKEN_SLOT)?;
        tracing::info!("cached token invalidated");
        Ok(())
    }

    /// Whether a token is currently cached
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn is_cached(&self) -> std::result::Result<bool, TokenError> {
        Ok(self.store.get(TOKEN_SLOT)?.is_some())
    }
}

/// One POST to the auth endpoint, persisting the token it returns
async fn request_token(
    client: reqwest::Client,
    auth_url: Url,
    store: Arc<dyn TokenStore>,
) -> std::result::Result<String, TokenError> {
    let credential = format!("ANONYMOUS{}", uuid::Uuid::new_v4());

    tracing::debug!(url = %auth_url, "refreshing token");

    let response = client
        .post(auth_url)
        .bearer_auth(credential)
        .header(CONTENT_TYPE, "application/json")
        .send()
        .await
        .map_err(|e| TokenError::NetworkError(e.to_string()))?;

    let status = response.status();
    if status != StatusCode::OK {
        tracing::warn!(status = status.as_u16(), "auth endpoint rejected token request");
        return Err(TokenError::InvalidResponse(format!("status {status}")));
    }

    let body: serde_json::Value = response.json().await.map_err(|e| {
        if e.is_decode() {
            TokenError::InvalidResponse(e.to_string())
        } else {
            TokenError::NetworkError(e.to_string())
        }
    })?;

    let token = body
        .get(TOKEN_FIELD)
        .and_then(serde_json::Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(TokenError::MissingToken)?
        .to_string();

    store.set(TOKEN_SLOT, &token)?;
    tracing::info!("token refreshed and cached");

    Ok(token)
}
