use crate::http::build_client;
use crate::marketplace::MarketplaceError;
use crate::marketplace::config::{APP_ID, APP_SECRET, OAUTH_TOKEN_URL, REFRESH_TOKEN};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;

/// Scope required for the conversation/message endpoints.
pub const MESSAGE_SCOPE: &str = "https://api.ebay.com/oauth/api_scope/commerce.message";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn basic_auth_header() -> Result<String, MarketplaceError> {
    if APP_ID.is_empty() || APP_SECRET.is_empty() {
        return Err(MarketplaceError::NotConnected);
    }
    let raw = format!("{}:{}", *APP_ID, *APP_SECRET);
    Ok(BASE64.encode(raw))
}

/// Exchange the stored refresh token for a bearer access token.
///
/// Missing credentials or refresh token surface as `NotConnected`, the
/// precondition failure that callers report without retrying.
pub async fn get_user_access_token() -> Result<String, MarketplaceError> {
    basic_auth_header()?;
    if REFRESH_TOKEN.is_empty() {
        return Err(MarketplaceError::NotConnected);
    }
    let body = [
        ("grant_type", "refresh_token"),
        ("refresh_token", REFRESH_TOKEN.as_str()),
        ("scope", MESSAGE_SCOPE),
    ];
    request_token(&body).await
}

async fn request_token(params: &[(&str, &str)]) -> Result<String, MarketplaceError> {
    let client = build_client();
    let response = client
        .post(OAUTH_TOKEN_URL.as_str())
        .basic_auth(APP_ID.as_str(), Some(APP_SECRET.as_str()))
        .form(&params)
        .send()
        .await
        .map_err(|err| MarketplaceError::Request(err.to_string()))?;

    if !response.status().is_success() {
        return Err(MarketplaceError::Request(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| MarketplaceError::Decode(err.to_string()))?;
    Ok(payload.access_token)
}
