use chrono::Utc;
use std::path::Path;
use tracing::info;

use crate::{
    error::Result,
    gateway::{Gateway, IMAGE_BUCKET},
};

const DEFAULT_EXTENSION: &str = "jpg";

pub fn image_extension(file: &Path) -> String {
    file.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

/// `posts/<userId>/<unix-millis>.<ext>` inside the image bucket.
pub fn object_path(user_id: &str, millis: i64, extension: &str) -> String {
    format!("posts/{}/{}.{}", user_id, millis, extension)
}

/// Recovers the object path from a public URL by cutting at its first
/// `/posts/` segment, which is the bucket name.
pub fn storage_path_from_public_url(url: &str) -> Option<String> {
    let idx = url.find("/posts/")?;
    let path = &url[idx + 1..];
    let path = path.strip_prefix("posts/").unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

impl Gateway {
    /// Uploads a local image for `user_id` and returns its public URL.
    pub async fn upload_image(&self, file: &Path, user_id: &str) -> Result<String> {
        let bytes = tokio::fs::read(file).await?;
        let extension = image_extension(file);
        let path = object_path(user_id, Utc::now().timestamp_millis(), &extension);

        self.backend
            .upload_object(IMAGE_BUCKET, &path, bytes, content_type_for(&extension))
            .await?;
        info!("Uploaded image to {}", path);

        Ok(self.backend.public_url(IMAGE_BUCKET, &path))
    }
}
