//! Typed client for the RedCloud metadata-node API. Stateless apart from
//! the bearer token; any metadata node answers any call.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct RedCloudClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredUser {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub tags: Vec<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
    #[serde(flatten)]
    pub file: FileMeta,
    pub replaced_file_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletedFiles {
    pub deleted_count: usize,
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaggedFiles {
    pub updated_count: usize,
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub skipped_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListFilesResponse {
    files: Vec<FileMeta>,
}

#[derive(Debug, Serialize)]
struct CredentialsRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct TagEditRequest<'a> {
    query_tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    new_tags: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags_to_remove: Option<&'a [String]>,
}

impl RedCloudClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn register(&mut self, username: &str, password: &str) -> Result<RegisteredUser> {
        let user: RegisteredUser = self
            .http
            .post(format!("{}/auth/register", self.base_url))
            .json(&CredentialsRequest { username, password })
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .context("registration rejected")?
            .json()
            .await?;

        self.token = Some(user.token.clone());
        Ok(user)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<String> {
        let response: LoginResponse = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .json(&CredentialsRequest { username, password })
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .context("login rejected")?
            .json()
            .await?;

        self.token = Some(response.token.clone());
        Ok(response.token)
    }

    pub async fn upload(&self, name: &str, tags: &[String], payload: Bytes) -> Result<UploadedFile> {
        let tags_joined = tags.join(",");
        let uploaded: UploadedFile = self
            .authorized(self.http.post(format!("{}/files", self.base_url)))?
            .query(&[("name", name), ("tags", tags_joined.as_str())])
            .body(payload)
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .with_context(|| format!("upload of '{name}' rejected"))?
            .json()
            .await?;
        Ok(uploaded)
    }

    pub async fn download(&self, file_id: &str) -> Result<Bytes> {
        let payload = self
            .authorized(
                self.http
                    .get(format!("{}/files/{}/download", self.base_url, file_id)),
            )?
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .with_context(|| format!("download of {file_id} failed"))?
            .bytes()
            .await?;
        Ok(payload)
    }

    pub async fn list(&self, tags: &[String]) -> Result<Vec<FileMeta>> {
        let response: ListFilesResponse = self
            .authorized(self.http.get(format!("{}/files", self.base_url)))?
            .query(&[("tags", tags.join(","))])
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .context("tag query rejected")?
            .json()
            .await?;
        Ok(response.files)
    }

    pub async fn delete(&self, tags: &[String]) -> Result<DeletedFiles> {
        let response: DeletedFiles = self
            .authorized(self.http.delete(format!("{}/files", self.base_url)))?
            .query(&[("tags", tags.join(","))])
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .context("delete rejected")?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn add_tags(&self, query_tags: &[String], new_tags: &[String]) -> Result<TaggedFiles> {
        let response: TaggedFiles = self
            .authorized(self.http.post(format!("{}/files/tags", self.base_url)))?
            .json(&TagEditRequest {
                query_tags,
                new_tags: Some(new_tags),
                tags_to_remove: None,
            })
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .context("tag edit rejected")?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn remove_tags(
        &self,
        query_tags: &[String],
        tags_to_remove: &[String],
    ) -> Result<TaggedFiles> {
        let response: TaggedFiles = self
            .authorized(self.http.delete(format!("{}/files/tags", self.base_url)))?
            .json(&TagEditRequest {
                query_tags,
                new_tags: None,
                tags_to_remove: Some(tags_to_remove),
            })
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .context("tag removal rejected")?
            .json()
            .await?;
        Ok(response)
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get_json("/health").await
    }

    pub async fn cluster_status(&self) -> Result<serde_json::Value> {
        self.get_json("/cluster/status").await
    }

    pub async fn nodes(&self) -> Result<serde_json::Value> {
        self.get_json("/cluster/nodes").await
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let value = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .context("failed to reach metadata node")?
            .error_for_status()
            .with_context(|| format!("request to {path} failed"))?
            .json()
            .await?;
        Ok(value)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("not logged in: call register or login first"))?;
        Ok(builder.bearer_auth(token))
    }
}
