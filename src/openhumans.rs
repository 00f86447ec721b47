use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://www.openhumans.org";

/// A project member as returned by the exchange-member call.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberInfo {
    pub project_member_id: String,
    #[serde(default)]
    pub data: Vec<MemberFile>,
}

impl MemberInfo {
    /// Newest file carrying `tag`. Files without a `created` stamp sort
    /// before any that have one.
    pub fn latest_tagged(&self, tag: &str) -> Option<&MemberFile> {
        self.data
            .iter()
            .filter(|f| f.metadata.tags.iter().any(|t| t == tag))
            .max_by(|a, b| a.created.cmp(&b.created))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberFile {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub basename: String,
    pub download_url: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Where to PUT the file bytes, plus the id to report on completion.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadTarget {
    pub url: String,
    pub id: Value,
}

impl UploadTarget {
    pub fn file_id(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Open Humans direct-sharing operations used by the sync job.
#[async_trait]
pub trait StorageService: Send + Sync {
    async fn exchange_member(&self, access_token: &str) -> Result<MemberInfo>;

    async fn download(&self, url: &str) -> Result<Vec<u8>>;

    async fn delete_file(&self, access_token: &str, project_member_id: &str, basename: &str) -> Result<()>;

    async fn request_upload(
        &self,
        access_token: &str,
        project_member_id: &str,
        filename: &str,
        metadata: &FileMetadata,
    ) -> Result<UploadTarget>;

    async fn put_file(&self, url: &str, bytes: Vec<u8>) -> Result<()>;

    async fn complete_upload(&self, access_token: &str, project_member_id: &str, file_id: &str) -> Result<()>;
}

/// `reqwest` client for the Open Humans direct-sharing API.
#[derive(Clone)]
pub struct OpenHumansClient {
    client: Client,
    base_url: Url,
}

impl OpenHumansClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)?;

        let client = Client::builder()
            .user_agent(concat!("ohsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str, access_token: &str) -> Result<Url> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut().append_pair("access_token", access_token);
        Ok(url)
    }

    /// OAuth2 token endpoint for refreshing Open Humans credentials.
    pub fn token_url(&self) -> Result<Url> {
        Ok(self.base_url.join("oauth2/token/")?)
    }
}

fn check(step: &'static str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        log::warn!("Open Humans {step} returned HTTP {status}");
        Err(Error::Storage {
            step,
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl StorageService for OpenHumansClient {
    async fn exchange_member(&self, access_token: &str) -> Result<MemberInfo> {
        let url = self.endpoint("api/direct-sharing/project/exchange-member/", access_token)?;
        let resp = check("exchange-member", self.client.get(url).send().await?)?;
        Ok(resp.json().await?)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = check("download", self.client.get(url).send().await?)?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete_file(&self, access_token: &str, project_member_id: &str, basename: &str) -> Result<()> {
        let url = self.endpoint("api/direct-sharing/project/files/delete/", access_token)?;
        let form = [("project_member_id", project_member_id), ("file_basename", basename)];
        check("delete", self.client.post(url).form(&form).send().await?)?;
        Ok(())
    }

    async fn request_upload(
        &self,
        access_token: &str,
        project_member_id: &str,
        filename: &str,
        metadata: &FileMetadata,
    ) -> Result<UploadTarget> {
        let url = self.endpoint("api/direct-sharing/project/files/upload/direct/", access_token)?;
        let metadata = serde_json::to_string(metadata)?;
        let form = [
            ("project_member_id", project_member_id),
            ("filename", filename),
            ("metadata", metadata.as_str()),
        ];
        let resp = check("upload request", self.client.post(url).form(&form).send().await?)?;
        Ok(resp.json().await?)
    }

    async fn put_file(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
        check("upload", self.client.put(url).body(bytes).send().await?)?;
        Ok(())
    }

    async fn complete_upload(&self, access_token: &str, project_member_id: &str, file_id: &str) -> Result<()> {
        let url = self.endpoint("api/direct-sharing/project/files/upload/complete/", access_token)?;
        let form = [("project_member_id", project_member_id), ("file_id", file_id)];
        check("upload complete", self.client.post(url).form(&form).send().await?)?;
        Ok(())
    }
}
