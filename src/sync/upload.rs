use chrono::Utc;

use crate::error::Result;
use crate::openhumans::{FileMetadata, StorageService};
use crate::sync::document::MergedDocument;
use crate::vendor::VendorAdapter;

/// Replace the member's vendor file with `doc`.
///
/// The old file is deleted first; a failed delete is logged and the upload
/// goes ahead, which can leave two files with the same basename until the
/// next successful replace.
pub async fn replace_file(
    storage: &dyn StorageService,
    adapter: &dyn VendorAdapter,
    access_token: &str,
    project_member_id: &str,
    doc: &MergedDocument,
) -> Result<()> {
    let basename = adapter.file_basename();

    if let Err(e) = storage
        .delete_file(access_token, project_member_id, basename)
        .await
    {
        log::warn!("Could not delete old {basename} for {project_member_id}: {e}");
    }

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(basename);
    tokio::fs::write(&path, doc.to_json_string()?).await?;
    let bytes = tokio::fs::read(&path).await?;

    let metadata = FileMetadata {
        description: adapter.file_description().to_string(),
        tags: adapter.file_tags(),
        updated_at: Some(Utc::now().to_rfc3339()),
    };
    let target = storage
        .request_upload(access_token, project_member_id, basename, &metadata)
        .await?;
    let size = bytes.len();
    storage.put_file(&target.url, bytes).await?;
    storage
        .complete_upload(access_token, project_member_id, &target.file_id())
        .await?;

    log::info!("Uploaded {basename} ({size} bytes) for {project_member_id}");
    Ok(())
}
