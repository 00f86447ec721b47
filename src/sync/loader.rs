use serde_json::Value;

use crate::error::{Error, Result};
use crate::openhumans::StorageService;
use crate::sync::document::MergedDocument;
use crate::vendor::VendorAdapter;

/// What the previous sync left behind for a member.
#[derive(Debug, Clone)]
pub struct ExistingData {
    pub project_member_id: String,
    pub document: MergedDocument,
    /// Download URL of the file the document was read from.
    pub source_url: Option<String>,
}

/// Find the newest file carrying the vendor's tag and parse it; a member
/// with no such file starts from the skeleton. A file that cannot be
/// downloaded or parsed fails the load rather than being replaced by an
/// empty document.
pub async fn load_existing(
    storage: &dyn StorageService,
    adapter: &dyn VendorAdapter,
    access_token: &str,
) -> Result<ExistingData> {
    let member = storage.exchange_member(access_token).await?;
    let catalog = adapter.catalog();

    let Some(file) = member.latest_tagged(adapter.tag()) else {
        log::info!(
            "No {} file for member {}, starting from an empty document",
            adapter.tag(),
            member.project_member_id
        );
        return Ok(ExistingData {
            project_member_id: member.project_member_id,
            document: MergedDocument::skeleton(catalog),
            source_url: None,
        });
    };

    log::debug!("Loading existing {} from {}", file.basename, file.download_url);
    let bytes = storage
        .download(&file.download_url)
        .await
        .map_err(|e| Error::ExistingData(format!("download of {} failed: {e}", file.basename)))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::ExistingData(format!("{} is not valid JSON: {e}", file.basename)))?;
    let document = MergedDocument::from_value(value, catalog)?;

    Ok(ExistingData {
        source_url: Some(file.download_url.clone()),
        project_member_id: member.project_member_id,
        document,
    })
}
