//! LinkedIn HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::{debug, info, warn};

use linkpost_models::{LinkedAccount, ScheduledPost, TokenGrant};

use crate::error::{LinkedInError, LinkedInResult};
use crate::types::{ApiErrorBody, RegisterUploadRequest, RegisterUploadResponse, TokenResponse, UgcPost, UgcPostResponse};

const RESTLI_HEADER: &str = "X-Restli-Protocol-Version";
const RESTLI_VERSION: &str = "2.0.0";
const RESTLI_ID_HEADER: &str = "x-restli-id";

/// Publishes a post on behalf of a linked account.
#[async_trait]
pub trait PostPublisher: Send + Sync {
    /// Publish the post's current content and return LinkedIn's post id.
    async fn publish(&self, account: &LinkedAccount, post: &ScheduledPost) -> LinkedInResult<String>;
}

/// Exchanges a refresh token for new credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> LinkedInResult<TokenGrant>;
}

/// Configuration for the LinkedIn client.
#[derive(Debug, Clone)]
pub struct LinkedInConfig {
    /// REST API base, e.g. `https://api.linkedin.com`
    pub api_base: String,
    /// OAuth base, e.g. `https://www.linkedin.com`
    pub oauth_base: String,
    pub client_id: String,
    pub client_secret: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for LinkedInConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.linkedin.com".to_string(),
            oauth_base: "https://www.linkedin.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl LinkedInConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("LINKEDIN_API_BASE")
                .unwrap_or_else(|_| "https://api.linkedin.com".to_string()),
            oauth_base: std::env::var("LINKEDIN_OAUTH_BASE")
                .unwrap_or_else(|_| "https://www.linkedin.com".to_string()),
            client_id: std::env::var("LINKEDIN_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("LINKEDIN_CLIENT_SECRET").unwrap_or_default(),
            timeout: Duration::from_secs(
                std::env::var("LINKEDIN_HTTP_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    fn ugc_posts_url(&self) -> String {
        format!("{}/v2/ugcPosts", self.api_base.trim_end_matches('/'))
    }

    fn register_upload_url(&self) -> String {
        format!("{}/v2/assets?action=registerUpload", self.api_base.trim_end_matches('/'))
    }

    fn token_url(&self) -> String {
        format!("{}/oauth/v2/accessToken", self.oauth_base.trim_end_matches('/'))
    }
}

/// Client for the LinkedIn REST and OAuth endpoints.
#[derive(Clone)]
pub struct LinkedInClient {
    http: Client,
    config: LinkedInConfig,
}

impl LinkedInClient {
    /// Create a new LinkedIn client.
    pub fn new(config: LinkedInConfig) -> LinkedInResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(LinkedInError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> LinkedInResult<Self> {
        Self::new(LinkedInConfig::from_env())
    }

    pub fn config(&self) -> &LinkedInConfig {
        &self.config
    }

    /// Register an image asset, copy the bytes from `image_url` into it and
    /// return the asset URN.
    pub async fn upload_image(&self, access_token: &str, owner: &str, image_url: &str) -> LinkedInResult<String> {
        let response = self
            .http
            .post(self.config.register_upload_url())
            .bearer_auth(access_token)
            .header(RESTLI_HEADER, RESTLI_VERSION)
            .json(&RegisterUploadRequest::image(owner))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(match status {
                401 => LinkedInError::AuthExpired,
                429 => LinkedInError::RateLimited,
                _ => LinkedInError::media_upload(format!("register upload returned {}", status)),
            });
        }

        let registered: RegisterUploadResponse = response.json().await?;
        let upload_url = registered.value.upload_mechanism.http_request.upload_url;

        let image = self.http.get(image_url).send().await?;
        if !image.status().is_success() {
            return Err(LinkedInError::media_upload(format!(
                "fetching {} returned {}",
                image_url,
                image.status()
            )));
        }
        let bytes = image.bytes().await?;

        let uploaded = self
            .http
            .put(&upload_url)
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        if !uploaded.status().is_success() {
            return Err(LinkedInError::media_upload(format!(
                "upload returned {}",
                uploaded.status()
            )));
        }

        debug!("Uploaded image {} as {}", image_url, registered.value.asset);
        Ok(registered.value.asset)
    }

    async fn create_ugc_post(&self, access_token: &str, body: &UgcPost) -> LinkedInResult<String> {
        let response = self
            .http
            .post(self.config.ugc_posts_url())
            .bearer_auth(access_token)
            .header(RESTLI_HEADER, RESTLI_VERSION)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let header_id = response
            .headers()
            .get(RESTLI_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = response.text().await?;
        let body_id = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<UgcPostResponse>(&text)
                .unwrap_or_default()
                .id
        };

        body_id
            .or(header_id)
            .ok_or_else(|| LinkedInError::invalid_response("post created without an id"))
    }
}

async fn error_from_response(response: Response) -> LinkedInError {
    let status = response.status().as_u16();
    let message = response
        .json::<ApiErrorBody>()
        .await
        .ok()
        .and_then(|body| body.message);

    warn!("LinkedIn API returned {}: {:?}", status, message);
    LinkedInError::from_status(status, message)
}

#[async_trait]
impl PostPublisher for LinkedInClient {
    async fn publish(&self, account: &LinkedAccount, post: &ScheduledPost) -> LinkedInResult<String> {
        let author = post
            .author_urn
            .clone()
            .unwrap_or_else(|| account.person_urn());

        let mut assets = Vec::with_capacity(post.media_urls.len());
        for url in &post.media_urls {
            assets.push(self.upload_image(&account.access_token, &author, url).await?);
        }

        let body = UgcPost::new(author, post.content.clone(), assets);
        let external_id = self.create_ugc_post(&account.access_token, &body).await?;

        info!(post_id = %post.id, external_id = %external_id, "Published post to LinkedIn");
        Ok(external_id)
    }
}

#[async_trait]
impl TokenRefresher for LinkedInClient {
    async fn refresh(&self, refresh_token: &str) -> LinkedInResult<TokenGrant> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(self.config.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| LinkedInError::refresh_failed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LinkedInError::refresh_failed(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LinkedInError::refresh_failed(e.to_string()))?;

        debug!("Refreshed LinkedIn access token");

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_tolerate_trailing_slash() {
        let config = LinkedInConfig {
            api_base: "https://api.example.com/".to_string(),
            oauth_base: "https://auth.example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ugc_posts_url(), "https://api.example.com/v2/ugcPosts");
        assert_eq!(
            config.register_upload_url(),
            "https://api.example.com/v2/assets?action=registerUpload"
        );
        assert_eq!(config.token_url(), "https://auth.example.com/oauth/v2/accessToken");
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(LinkedInConfig::default().timeout, Duration::from_secs(30));
    }
}
