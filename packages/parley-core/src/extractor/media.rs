//! Media descriptors.
//!
//! A descriptor is the content payload with its cryptographic and bulky
//! fields removed. The bytes themselves are fetched lazily through the
//! protocol client's [`MediaDownloader`], which needs the untouched
//! payload, so the descriptor keeps a private copy of it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::envelope::ChatType;
use crate::error::{Error, Result};

/// Payload fields never exposed to the application
pub const STRIPPED_FIELDS: &[&str] = &[
    "mediaKey",
    "mediaKeyTimestamp",
    "fileSha256",
    "fileEncSha256",
    "jpegThumbnail",
    "pngThumbnail",
    "directPath",
    "thumbnailDirectPath",
    "thumbnailSha256",
    "thumbnailEncSha256",
    "streamingSidecar",
    "scansSidecar",
    "scanLengths",
    "firstScanSidecar",
    "firstScanLength",
    "midQualityFileSha256",
    "midQualityFileEncSha256",
    "contextInfo",
];

/// Download capability of the protocol client
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Fetch and decrypt the whole media file
    async fn download(&self, kind: ChatType, payload: &Value) -> Result<Bytes>;

    /// Stream the media file
    ///
    /// The default buffers the whole file and yields it as one chunk.
    async fn stream(&self, kind: ChatType, payload: &Value) -> Result<BoxStream<'static, Result<Bytes>>> {
        let bytes = self.download(kind, payload).await?;
        Ok(stream::once(async move { Ok(bytes) }).boxed())
    }
}

/// Media (or other non-text content) attached to a message
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    /// Content kind
    pub kind: ChatType,
    /// Payload without stripped fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(skip)]
    raw: Arc<Value>,
    #[serde(skip)]
    downloader: Option<Arc<dyn MediaDownloader>>,
}

impl MediaDescriptor {
    /// Build a descriptor from a content payload
    ///
    /// Returns `None` when the payload is not an object.
    pub fn new(kind: ChatType, payload: &Value, downloader: Option<Arc<dyn MediaDownloader>>) -> Option<Self> {
        let object = payload.as_object()?;
        let fields = object
            .iter()
            .filter(|(field, _)| !STRIPPED_FIELDS.contains(&field.as_str()))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();

        Some(Self {
            kind,
            fields,
            raw: Arc::new(payload.clone()),
            downloader,
        })
    }

    /// Whether bytes can be fetched for this descriptor
    pub fn is_downloadable(&self) -> bool {
        self.kind.is_media() && self.downloader.is_some()
    }

    fn downloader(&self) -> Result<&Arc<dyn MediaDownloader>> {
        if !self.kind.is_media() {
            return Err(Error::MediaUnavailable(format!("{:?} has no media", self.kind)));
        }
        self.downloader
            .as_ref()
            .ok_or_else(|| Error::MediaUnavailable("no media downloader configured".into()))
    }

    /// Download the whole file
    pub async fn buffer(&self) -> Result<Bytes> {
        self.downloader()?.download(self.kind, &self.raw).await
    }

    /// Stream the file
    pub async fn stream(&self) -> Result<BoxStream<'static, Result<Bytes>>> {
        self.downloader()?.stream(self.kind, &self.raw).await
    }
}

impl fmt::Debug for MediaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaDescriptor")
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl MediaDownloader for Fixed {
        async fn download(&self, _kind: ChatType, payload: &Value) -> Result<Bytes> {
            // Proves the unstripped payload reaches the downloader.
            let key = payload["mediaKey"].as_str().unwrap_or_default().to_string();
            Ok(Bytes::from(key))
        }
    }

    fn image() -> Value {
        json!({
            "url": "https://mmg.example/x",
            "mimetype": "image/jpeg",
            "caption": "pic",
            "mediaKey": "secret",
            "fileSha256": "abc",
            "jpegThumbnail": "AAAA",
            "directPath": "/v/t62",
            "contextInfo": {"stanzaId": "Q1"}
        })
    }

    #[test]
    fn test_strips_binary_fields() {
        let descriptor = MediaDescriptor::new(ChatType::Image, &image(), None).unwrap();
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            json,
            json!({"kind": "image", "url": "https://mmg.example/x", "mimetype": "image/jpeg", "caption": "pic"})
        );
    }

    #[tokio::test]
    async fn test_buffer_and_stream_use_raw_payload() {
        let descriptor = MediaDescriptor::new(ChatType::Image, &image(), Some(Arc::new(Fixed))).unwrap();
        assert!(descriptor.is_downloadable());
        assert_eq!(descriptor.buffer().await.unwrap(), Bytes::from("secret"));

        let chunks: Vec<Bytes> = descriptor
            .stream()
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from("secret")]);
    }

    #[tokio::test]
    async fn test_unavailable_without_downloader_or_media() {
        let descriptor = MediaDescriptor::new(ChatType::Image, &image(), None).unwrap();
        assert!(matches!(descriptor.buffer().await, Err(Error::MediaUnavailable(_))));

        let location = json!({"degreesLatitude": 1.0});
        let descriptor = MediaDescriptor::new(ChatType::Location, &location, Some(Arc::new(Fixed))).unwrap();
        assert!(matches!(descriptor.buffer().await, Err(Error::MediaUnavailable(_))));
    }

    #[test]
    fn test_non_object_payload() {
        assert!(MediaDescriptor::new(ChatType::Text, &json!("hi"), None).is_none());
    }
}
