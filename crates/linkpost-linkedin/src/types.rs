//! Wire types for the LinkedIn REST endpoints.

use serde::{Deserialize, Serialize};

const IMAGE_RECIPE: &str = "urn:li:digitalmediaRecipe:feedshare-image";

/// Body of `POST /v2/ugcPosts`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UgcPost {
    pub author: String,
    pub lifecycle_state: &'static str,
    pub specific_content: SpecificContent,
    pub visibility: Visibility,
}

#[derive(Debug, Serialize)]
pub struct SpecificContent {
    #[serde(rename = "com.linkedin.ugc.ShareContent")]
    pub share_content: ShareContent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareContent {
    pub share_commentary: ShareCommentary,
    pub share_media_category: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<ShareMedia>,
}

#[derive(Debug, Serialize)]
pub struct ShareCommentary {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ShareMedia {
    pub status: &'static str,
    pub media: String,
}

#[derive(Debug, Serialize)]
pub struct Visibility {
    #[serde(rename = "com.linkedin.ugc.MemberNetworkVisibility")]
    pub member_network: &'static str,
}

impl UgcPost {
    /// Build a public post; images switch the media category.
    pub fn new(author: impl Into<String>, text: impl Into<String>, assets: Vec<String>) -> Self {
        let category = if assets.is_empty() { "NONE" } else { "IMAGE" };
        Self {
            author: author.into(),
            lifecycle_state: "PUBLISHED",
            specific_content: SpecificContent {
                share_content: ShareContent {
                    share_commentary: ShareCommentary { text: text.into() },
                    share_media_category: category,
                    media: assets
                        .into_iter()
                        .map(|media| ShareMedia { status: "READY", media })
                        .collect(),
                },
            },
            visibility: Visibility { member_network: "PUBLIC" },
        }
    }
}

/// Response of `POST /v2/ugcPosts`; the id may instead arrive in `x-restli-id`.
#[derive(Debug, Default, Deserialize)]
pub struct UgcPostResponse {
    pub id: Option<String>,
}

/// Body of `POST /v2/assets?action=registerUpload`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadRequest {
    pub register_upload_request: RegisterUpload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUpload {
    pub recipes: Vec<&'static str>,
    pub owner: String,
    pub service_relationships: Vec<ServiceRelationship>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRelationship {
    pub relationship_type: &'static str,
    pub identifier: &'static str,
}

impl RegisterUploadRequest {
    pub fn image(owner: impl Into<String>) -> Self {
        Self {
            register_upload_request: RegisterUpload {
                recipes: vec![IMAGE_RECIPE],
                owner: owner.into(),
                service_relationships: vec![ServiceRelationship {
                    relationship_type: "OWNER",
                    identifier: "urn:li:userGeneratedContent",
                }],
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterUploadResponse {
    pub value: RegisterUploadValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadValue {
    pub asset: String,
    pub upload_mechanism: UploadMechanism,
}

#[derive(Debug, Deserialize)]
pub struct UploadMechanism {
    #[serde(rename = "com.linkedin.digitalmedia.uploading.MediaUploadHttpRequest")]
    pub http_request: UploadHttpRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadHttpRequest {
    pub upload_url: String,
}

/// OAuth token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Error body returned by the REST API.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    pub message: Option<String>,
}
