//! OAuth2 password-grant authenticator.
//!
//! Every authentication attempt hits the endpoint; there is no caching.
//! Denial reasons are logged but never surfaced to the SSH client.

use log::{error, info};
use reqwest::StatusCode;

use crate::config::Config;

pub struct Authenticator {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
}

impl Authenticator {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.oauth_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    /// Forward the credentials to the endpoint; allow iff it answers 200.
    pub async fn authenticate(&self, username: &str, password: &str) -> bool {
        let form = [
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("username", username),
            ("password", password),
        ];

        match self.client.post(&self.endpoint).form(&form).send().await {
            Ok(resp) => {
                let success = resp.status() == StatusCode::OK;
                info!("authentication attempt for {username}: success={success}");
                success
            }
            Err(e) => {
                error!("authentication request for {username} failed: {e}");
                false
            }
        }
    }
}
