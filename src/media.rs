// Media preparation for outbound image sends. Input is either inline
// base64 (raw or data-URL) or a remote URL that gets size-checked with a
// HEAD probe before download. Prepared bytes optionally land in the temp
// preview directory.
use crate::error::{coded, ErrorCode};
use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const MAX_MEDIA_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_FILENAME: &str = "image.jpg";
const DEFAULT_MIME: &str = "image/jpeg";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const SWEEP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Opaque media payload in the shape the chat client accepts.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    pub mime_type: String,
    pub base64: String,
    pub filename: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaRequest {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub save_to_temp: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct PreparedMedia {
    pub handle: MediaHandle,
    pub preview_path: Option<PathBuf>,
}

pub struct MediaStore {
    http: reqwest::Client,
    temp_dir: PathBuf,
}

impl MediaStore {
    pub fn new(http: reqwest::Client, temp_dir: PathBuf) -> Self {
        Self { http, temp_dir }
    }

    pub async fn prepare(&self, request: MediaRequest) -> Result<PreparedMedia> {
        let (bytes, mime_type, filename) = match (&request.data, &request.url) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(coded(
                    ErrorCode::InvalidPayload,
                    "exactly one of data or url must be provided",
                ));
            }
            (Some(data), None) => decode_inline(data, &request)?,
            (None, Some(url)) => self.fetch_remote(url, &request).await?,
        };

        let preview_path = if request.save_to_temp.unwrap_or(true) {
            match self.save_preview(&bytes, &filename).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!("media preview write failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        Ok(PreparedMedia {
            handle: MediaHandle {
                mime_type,
                base64: STANDARD.encode(&bytes),
                filename,
            },
            preview_path,
        })
    }

    async fn fetch_remote(
        &self,
        url: &str,
        request: &MediaRequest,
    ) -> Result<(Vec<u8>, String, String)> {
        let head = self
            .http
            .head(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|err| {
                coded(ErrorCode::BadGateway, format!("media HEAD failed: {err}"))
            })?;
        if !head.status().is_success() {
            return Err(coded(
                ErrorCode::BadGateway,
                format!("media HEAD returned {}", head.status()),
            ));
        }
        let declared = head
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        match declared {
            Some(size) if size <= MAX_MEDIA_BYTES => {}
            _ => {
                return Err(coded(
                    ErrorCode::MediaTooLarge,
                    format!("remote media missing size or over {MAX_MEDIA_BYTES} bytes"),
                ));
            }
        }

        let response = self
            .http
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|err| {
                coded(ErrorCode::BadGateway, format!("media download failed: {err}"))
            })?;
        if !response.status().is_success() {
            return Err(coded(
                ErrorCode::BadGateway,
                format!("media download returned {}", response.status()),
            ));
        }
        let served_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|err| {
                coded(ErrorCode::BadGateway, format!("media read failed: {err}"))
            })?
            .to_vec();
        if bytes.len() > MAX_MEDIA_BYTES {
            return Err(coded(
                ErrorCode::MediaTooLarge,
                format!("remote media exceeds {MAX_MEDIA_BYTES} bytes"),
            ));
        }

        let mime_type = served_mime
            .or_else(|| request.mime_type.clone())
            .unwrap_or_else(|| DEFAULT_MIME.to_string());
        let filename = request
            .filename
            .clone()
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
        Ok((bytes, mime_type, filename))
    }

    async fn save_preview(&self, bytes: &[u8], filename: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let path = self
            .temp_dir
            .join(format!("{}-{filename}", Utc::now().timestamp_millis()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

fn decode_inline(data: &str, request: &MediaRequest) -> Result<(Vec<u8>, String, String)> {
    let trimmed = data.trim();
    let (data_url_mime, encoded) = match trimmed.split_once(',') {
        Some((meta, payload)) if meta.starts_with("data:") => {
            let mime = meta
                .trim_start_matches("data:")
                .split(';')
                .next()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            (mime, payload)
        }
        _ => (None, trimmed),
    };
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|err| coded(ErrorCode::InvalidPayload, format!("invalid base64 data: {err}")))?;
    if bytes.len() > MAX_MEDIA_BYTES {
        return Err(coded(
            ErrorCode::MediaTooLarge,
            format!("media exceeds {MAX_MEDIA_BYTES} bytes"),
        ));
    }
    let mime_type = request
        .mime_type
        .clone()
        .or(data_url_mime)
        .unwrap_or_else(|| DEFAULT_MIME.to_string());
    let filename = request
        .filename
        .clone()
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
    Ok((bytes, mime_type, filename))
}

fn filename_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(|segment| segment.to_string())
}

/// Background sweep of the preview directory: anything older than a day
/// is removed.
pub fn spawn_temp_sweeper(temp_dir: PathBuf) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_once(&temp_dir, SWEEP_MAX_AGE) {
                warn!("temp sweep failed: {err}");
            }
        }
    });
}

fn sweep_once(temp_dir: &Path, max_age: Duration) -> Result<()> {
    let entries = match std::fs::read_dir(temp_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    let now = std::time::SystemTime::now();
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if now
            .duration_since(modified)
            .map(|age| age >= max_age)
            .unwrap_or(false)
        {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code_of;

    fn store() -> MediaStore {
        let dir = std::env::temp_dir().join(format!("wwebjs-media-test-{}", uuid::Uuid::new_v4()));
        MediaStore::new(reqwest::Client::new(), dir)
    }

    #[tokio::test]
    async fn rejects_missing_and_double_sources() {
        let store = store();
        let err = store.prepare(MediaRequest::default()).await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::InvalidPayload);

        let err = store
            .prepare(MediaRequest {
                data: Some("QUJD".to_string()),
                url: Some("http://example.com/x.png".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn decodes_raw_base64_and_data_urls() {
        let store = store();
        let prepared = store
            .prepare(MediaRequest {
                data: Some("QUJD".to_string()),
                save_to_temp: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(prepared.handle.base64, "QUJD");
        assert_eq!(prepared.handle.mime_type, "image/jpeg");
        assert_eq!(prepared.handle.filename, "image.jpg");
        assert!(prepared.preview_path.is_none());

        let prepared = store
            .prepare(MediaRequest {
                data: Some("data:image/png;base64,QUJD".to_string()),
                filename: Some("pic.png".to_string()),
                save_to_temp: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(prepared.handle.mime_type, "image/png");
        assert_eq!(prepared.handle.filename, "pic.png");
    }

    #[tokio::test]
    async fn size_limit_is_exact() {
        let store = store();
        let at_limit = STANDARD.encode(vec![0u8; MAX_MEDIA_BYTES]);
        let prepared = store
            .prepare(MediaRequest {
                data: Some(at_limit),
                save_to_temp: Some(false),
                ..Default::default()
            })
            .await;
        assert!(prepared.is_ok());

        let over_limit = STANDARD.encode(vec![0u8; MAX_MEDIA_BYTES + 1]);
        let err = store
            .prepare(MediaRequest {
                data: Some(over_limit),
                save_to_temp: Some(false),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::MediaTooLarge);
    }

    #[tokio::test]
    async fn invalid_base64_is_a_payload_error() {
        let store = store();
        let err = store
            .prepare(MediaRequest {
                data: Some("!!not-base64!!".to_string()),
                save_to_temp: Some(false),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn preview_file_lands_in_temp_dir() {
        let store = store();
        let prepared = store
            .prepare(MediaRequest {
                data: Some("QUJD".to_string()),
                filename: Some("note.jpg".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let path = prepared.preview_path.expect("preview saved by default");
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"ABC");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn filename_derivation_from_url() {
        assert_eq!(
            filename_from_url("http://cdn.example.com/images/photo.png?sig=abc"),
            Some("photo.png".to_string())
        );
        assert_eq!(filename_from_url("http://cdn.example.com/"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }

    #[test]
    fn sweep_removes_only_stale_files() {
        let dir = std::env::temp_dir().join(format!("wwebjs-sweep-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let fresh = dir.join("fresh.jpg");
        std::fs::write(&fresh, b"x").unwrap();
        sweep_once(&dir, Duration::from_secs(3600)).unwrap();
        assert!(fresh.exists());
        sweep_once(&dir, Duration::ZERO).unwrap();
        assert!(!fresh.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
