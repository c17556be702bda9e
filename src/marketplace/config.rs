use once_cell::sync::Lazy;
use std::env;

pub static MARKETPLACE_ENV: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static APP_ID: Lazy<String> = Lazy::new(|| env::var("MARKETPLACE_APP_ID").unwrap_or_default());

pub static APP_SECRET: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_CERT_ID").unwrap_or_default());

pub static REFRESH_TOKEN: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_REFRESH_TOKEN").unwrap_or_default());

/// The seller's own marketplace username; drives buyer/seller classification.
pub static SELLER_USERNAME: Lazy<String> =
    Lazy::new(|| env::var("MARKETPLACE_SELLER_USERNAME").unwrap_or_default());

pub static ROOT: Lazy<String> = Lazy::new(|| {
    if MARKETPLACE_ENV.as_str().eq_ignore_ascii_case("PROD") {
        "https://api.ebay.com".to_string()
    } else {
        "https://api.sandbox.ebay.com".to_string()
    }
});

pub static OAUTH_TOKEN_URL: Lazy<String> =
    Lazy::new(|| format!("{}/identity/v1/oauth2/token", *ROOT));

pub const MESSAGE_API_BASE: &str = "/commerce/message/v1";
