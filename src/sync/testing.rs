//! In-process fakes for the sync collaborators.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::oauth::Credentials;
use crate::openhumans::{FileMetadata, MemberFile, MemberInfo, StorageService, UploadTarget};
use crate::storage::repository::Member;
use crate::sync::retry::RetryScheduler;
use crate::vendor::{VendorClient, VendorResponse};

pub(crate) const PROJECT_MEMBER_ID: &str = "12345678";

pub(crate) fn sample_member(oh_id: &str) -> Member {
    let now = Utc::now();
    Member {
        oh_id: oh_id.to_string(),
        oh_credentials: Credentials::new("oh-access", "oh-refresh", 36_000, now),
        vendor: "fitbit".into(),
        vendor_user_id: Some("ABC123".into()),
        vendor_credentials: Credentials::new("vendor-access", "vendor-refresh", 28_800, now),
        vendor_scope: Some("activity heartrate sleep weight profile".into()),
        last_updated: None,
        last_submitted: None,
    }
}

pub(crate) fn profile_body(encoded_id: &str, member_since: &str) -> Value {
    json!({
        "user": {
            "encodedId": encoded_id,
            "memberSince": member_since,
            "averageDailySteps": 8123,
            "height": 180.3,
            "strideLengthRunning": 120.1,
            "strideLengthWalking": 74.4,
            "weight": 81.2,
            "fullName": "not kept"
        }
    })
}

/// Vendor that answers the profile URL with a configurable profile and every
/// other URL with `{"url": <url>, "call": <n>}`, unless a fixed response is
/// registered for a URL fragment.
pub(crate) struct FakeVendor {
    profile: Mutex<Value>,
    overrides: Mutex<Vec<(String, VendorResponse)>>,
    calls: Mutex<Vec<String>>,
}

impl FakeVendor {
    pub(crate) fn new(encoded_id: &str, member_since: &str) -> Self {
        Self {
            profile: Mutex::new(profile_body(encoded_id, member_since)),
            overrides: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_profile(&self, encoded_id: &str, member_since: &str) {
        *self.profile.lock().unwrap() = profile_body(encoded_id, member_since);
    }

    pub(crate) fn respond(&self, url_fragment: &str, status: u16, body: &str) {
        self.overrides.lock().unwrap().push((
            url_fragment.to_string(),
            VendorResponse {
                status,
                body: body.to_string(),
            },
        ));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl VendorClient for FakeVendor {
    async fn get(&self, url: &str, authorization: &str) -> Result<VendorResponse> {
        assert!(authorization.starts_with("Bearer "), "bad auth header {authorization}");
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(url.to_string());
            calls.len()
        };

        if let Some((_, resp)) = self
            .overrides
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
        {
            return Ok(resp.clone());
        }
        if url.ends_with("/-/profile.json") {
            let body = self.profile.lock().unwrap().to_string();
            return Ok(VendorResponse { status: 200, body });
        }
        Ok(VendorResponse {
            status: 200,
            body: json!({"url": url, "call": n}).to_string(),
        })
    }
}

/// Open Humans storage holding at most one file, with every call recorded.
#[derive(Default)]
pub(crate) struct FakeStorage {
    current: Mutex<Option<Vec<u8>>>,
    staged: Mutex<Option<Vec<u8>>>,
    uploads: Mutex<u32>,
    fail_step: Mutex<Option<&'static str>>,
    calls: Mutex<Vec<String>>,
    metadata: Mutex<Vec<FileMetadata>>,
}

impl FakeStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_file(bytes: &[u8]) -> Self {
        let storage = Self::default();
        *storage.current.lock().unwrap() = Some(bytes.to_vec());
        storage
    }

    /// Make the named step (`"exchange"`, `"download"`, `"delete"`,
    /// `"request"`, `"put"`, `"complete"`) fail with HTTP 500.
    pub(crate) fn fail_at(&self, step: &'static str) {
        *self.fail_step.lock().unwrap() = Some(step);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn uploads(&self) -> u32 {
        *self.uploads.lock().unwrap()
    }

    pub(crate) fn last_metadata(&self) -> Option<FileMetadata> {
        self.metadata.lock().unwrap().last().cloned()
    }

    /// The stored file parsed as JSON.
    pub(crate) fn current_json(&self) -> Option<Value> {
        let current = self.current.lock().unwrap();
        current.as_ref().map(|b| serde_json::from_slice(b).unwrap())
    }

    fn enter(&self, step: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(step.to_string());
        if *self.fail_step.lock().unwrap() == Some(step) {
            return Err(Error::Storage { step, status: 500 });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageService for FakeStorage {
    async fn exchange_member(&self, access_token: &str) -> Result<MemberInfo> {
        self.enter("exchange")?;
        assert!(!access_token.is_empty());
        let data = if self.current.lock().unwrap().is_some() {
            vec![MemberFile {
                id: Some(json!(1)),
                basename: "fitbit-data.json".into(),
                download_url: "fake://current".into(),
                created: Some("2021-01-01T00:00:00Z".into()),
                metadata: FileMetadata {
                    description: "Fitbit data.".into(),
                    tags: vec!["Fitbit".into()],
                    updated_at: None,
                },
            }]
        } else {
            Vec::new()
        };
        Ok(MemberInfo {
            project_member_id: PROJECT_MEMBER_ID.into(),
            data,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.enter("download")?;
        assert_eq!(url, "fake://current");
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Storage {
                step: "download",
                status: 404,
            })
    }

    async fn delete_file(&self, _access_token: &str, project_member_id: &str, _basename: &str) -> Result<()> {
        self.enter("delete")?;
        assert_eq!(project_member_id, PROJECT_MEMBER_ID);
        *self.current.lock().unwrap() = None;
        Ok(())
    }

    async fn request_upload(
        &self,
        _access_token: &str,
        project_member_id: &str,
        filename: &str,
        metadata: &FileMetadata,
    ) -> Result<UploadTarget> {
        self.enter("request")?;
        assert_eq!(project_member_id, PROJECT_MEMBER_ID);
        assert_eq!(filename, "fitbit-data.json");
        self.metadata.lock().unwrap().push(metadata.clone());
        Ok(UploadTarget {
            url: "fake://put".into(),
            id: json!(77),
        })
    }

    async fn put_file(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
        self.enter("put")?;
        assert_eq!(url, "fake://put");
        *self.staged.lock().unwrap() = Some(bytes);
        Ok(())
    }

    async fn complete_upload(&self, _access_token: &str, _project_member_id: &str, file_id: &str) -> Result<()> {
        self.enter("complete")?;
        assert_eq!(file_id, "77");
        let staged = self.staged.lock().unwrap().take();
        *self.current.lock().unwrap() = staged;
        *self.uploads.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingScheduler {
    queued: Mutex<Vec<String>>,
    retries: Mutex<Vec<(String, Duration)>>,
}

impl RecordingScheduler {
    pub(crate) fn queued(&self) -> Vec<String> {
        self.queued.lock().unwrap().clone()
    }

    pub(crate) fn retries(&self) -> Vec<(String, Duration)> {
        self.retries.lock().unwrap().clone()
    }
}

impl RetryScheduler for RecordingScheduler {
    fn queue(&self, oh_id: &str) {
        self.queued.lock().unwrap().push(oh_id.to_string());
    }

    fn retry(&self, oh_id: &str, delay: Duration) {
        self.retries.lock().unwrap().push((oh_id.to_string(), delay));
    }
}

/// Token endpoint that always hands out the same fresh token.
pub(crate) struct StaticTokens;

#[async_trait]
impl crate::oauth::TokenEndpoint for StaticTokens {
    async fn refresh(&self, _refresh_token: &str) -> Result<crate::oauth::TokenResponse> {
        Ok(crate::oauth::TokenResponse {
            access_token: "fresh-access".into(),
            refresh_token: Some("fresh-refresh".into()),
            expires_in: 28_800,
            scope: None,
            user_id: None,
        })
    }
}
