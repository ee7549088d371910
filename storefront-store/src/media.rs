//! Binary asset handling.
//!
//! Documents never carry binary payloads; they carry URLs. `MediaUploader`
//! pushes assets to an [`ObjectStore`] and hands back the public URL. When the
//! object store refuses an upload, a [`FallbackPolicy`] decides whether the
//! asset may be inlined into the document as a `data:` URL instead.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use crate::document::now_ms;
use crate::error::{StoreError, StoreResult};

/// Largest asset accepted for upload (5MB).
pub const MAX_UPLOAD_SIZE: usize = 5 * 1024 * 1024;

/// Default inline ceiling: keeps the base64 form under a 1MiB document.
pub const DEFAULT_INLINE_CEILING: usize = 700 * 1024;

pub const DEFAULT_BUCKET: &str = "images";
pub const DEFAULT_FOLDER: &str = "uploads";

/// Path prefix of public object URLs.
const PUBLIC_OBJECT_PREFIX: &str = "/storage/v1/object/public/";

/// Characters escaped inside an object path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A binary asset and its declared MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl MediaAsset {
    pub fn new(bytes: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }

    /// Declared MIME, with empty and generic binary types treated as JPEG.
    pub fn content_type(&self) -> &str {
        match self.mime.trim() {
            "" | "application/octet-stream" => "image/jpeg",
            mime => mime,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// File extension for a content type.
pub fn extension_for(content_type: &str) -> &'static str {
    if content_type.contains("png") {
        "png"
    } else if content_type.contains("webp") {
        "webp"
    } else if content_type.contains("gif") {
        "gif"
    } else if content_type.contains("video/mp4") {
        "mp4"
    } else {
        "jpg"
    }
}

/// Object storage for uploaded assets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `bucket/path`, overwriting, and return the public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> StoreResult<String>;

    /// Delete `paths` from `bucket`. Missing objects are not an error.
    async fn remove(&self, bucket: &str, paths: &[String]) -> StoreResult<()>;
}

// ─── Fallback policy ────────────────────────────────────────────

/// Decides what to store when an upload fails.
pub trait FallbackPolicy: Send + Sync {
    /// A URL to use in place of the failed upload, or `None` to give up.
    fn fallback(&self, asset: &MediaAsset) -> Option<String>;
}

/// Inline assets up to `ceiling` bytes as `data:` URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineFallback {
    pub ceiling: usize,
}

impl Default for InlineFallback {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_INLINE_CEILING,
        }
    }
}

impl FallbackPolicy for InlineFallback {
    fn fallback(&self, asset: &MediaAsset) -> Option<String> {
        (asset.len() <= self.ceiling).then(|| encode_data_url(asset))
    }
}

/// Never fall back; failed uploads are errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFallback;

impl FallbackPolicy for NoFallback {
    fn fallback(&self, _asset: &MediaAsset) -> Option<String> {
        None
    }
}

// ─── Uploader ───────────────────────────────────────────────────

/// Uploads and removes assets referenced by documents.
pub struct MediaUploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    fallback: Box<dyn FallbackPolicy>,
    max_size: usize,
}

impl MediaUploader {
    /// Uploader for the default bucket with inline fallback.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            bucket: DEFAULT_BUCKET.to_string(),
            fallback: Box::new(InlineFallback::default()),
            max_size: MAX_UPLOAD_SIZE,
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let bucket = bucket.trim();
        if !bucket.is_empty() {
            self.bucket = bucket.to_string();
        }
        self
    }

    pub fn with_fallback(mut self, fallback: impl FallbackPolicy + 'static) -> Self {
        self.fallback = Box::new(fallback);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload `asset` under `folder` and return the URL to put in a document.
    pub async fn store(&self, asset: &MediaAsset, folder: &str) -> StoreResult<String> {
        if asset.len() > self.max_size {
            log::warn!("File too large: {} bytes", asset.len());
            return Err(StoreError::Media(format!(
                "asset of {} bytes exceeds the {} byte limit",
                asset.len(),
                self.max_size
            )));
        }

        let content_type = asset.content_type();
        let path = object_path(folder, content_type);

        match self
            .store
            .upload(&self.bucket, &path, &asset.bytes, content_type)
            .await
        {
            Ok(url) if !url.is_empty() => Ok(url),
            Ok(_) => self.fall_back(asset, "no public URL returned"),
            Err(e) => {
                log::error!("Upload to bucket '{}' failed: {e}", self.bucket);
                self.fall_back(asset, &e.to_string())
            }
        }
    }

    fn fall_back(&self, asset: &MediaAsset, reason: &str) -> StoreResult<String> {
        match self.fallback.fallback(asset) {
            Some(url) => {
                log::warn!("Storing {} byte asset inline: {reason}", asset.len());
                Ok(url)
            }
            None => Err(StoreError::Media(format!("upload failed: {reason}"))),
        }
    }

    /// Delete the objects behind `urls`, one request per bucket.
    ///
    /// Strings that are not http(s) URLs (including inline `data:` URLs) are
    /// ignored. Per-bucket failures are logged. Returns the number of paths
    /// removed.
    pub async fn remove_urls<S: AsRef<str>>(&self, urls: &[S]) -> usize {
        let grouped = group_by_bucket(urls.iter().map(AsRef::as_ref), &self.bucket);

        let mut removed = 0;
        for (bucket, paths) in grouped {
            match self.store.remove(&bucket, &paths).await {
                Ok(()) => {
                    log::info!("Deleted {} files from bucket [{bucket}]", paths.len());
                    removed += paths.len();
                }
                Err(e) => log::error!("Error deleting from bucket [{bucket}]: {e}"),
            }
        }
        removed
    }
}

/// `<folder>/<ms>_<random>.<ext>`
fn object_path(folder: &str, content_type: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    let folder = folder.trim_matches('/');
    let folder = if folder.is_empty() { DEFAULT_FOLDER } else { folder };
    format!("{folder}/{}_{suffix}.{}", now_ms(), extension_for(content_type))
}

/// Split object URLs into bucket → paths.
fn group_by_bucket<'a>(
    urls: impl Iterator<Item = &'a str>,
    default_bucket: &str,
) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for raw in urls {
        if let Some((bucket, path)) = parse_object_url(raw, default_bucket) {
            grouped.entry(bucket).or_default().push(path);
        }
    }
    grouped
}

/// Extract `(bucket, path)` from a public object URL.
pub fn parse_object_url(raw: &str, default_bucket: &str) -> Option<(String, String)> {
    if !raw.starts_with("http") {
        return None;
    }

    if let Ok(url) = Url::parse(raw) {
        if let Some(rest) = url.path().split_once(PUBLIC_OBJECT_PREFIX).map(|(_, r)| r) {
            if let Some((bucket, path)) = rest.split_once('/') {
                if !bucket.is_empty() && !path.is_empty() {
                    return Some((bucket.to_string(), decode(path)));
                }
            }
        }
    }

    let marker = format!("/{default_bucket}/");
    raw.split_once(&marker)
        .filter(|(_, path)| !path.is_empty())
        .map(|(_, path)| (default_bucket.to_string(), decode(path)))
}

fn decode(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

// ─── Data URLs ──────────────────────────────────────────────────

/// `data:<mime>;base64,<payload>`
pub fn encode_data_url(asset: &MediaAsset) -> String {
    format!(
        "data:{};base64,{}",
        asset.content_type(),
        BASE64.encode(&asset.bytes)
    )
}

/// Decode a `data:` URL or bare base64 into an asset. Bare base64 is assumed
/// to be JPEG.
pub fn decode_data_url(input: &str) -> StoreResult<MediaAsset> {
    let (mime, payload) = match input.split_once(',') {
        Some((header, payload)) => {
            let mime = header
                .split_once(':')
                .and_then(|(_, rest)| rest.split_once(';'))
                .map(|(mime, _)| mime)
                .filter(|mime| !mime.is_empty())
                .unwrap_or("image/jpeg");
            (mime, payload)
        }
        None => ("image/jpeg", input),
    };

    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| StoreError::Media(format!("invalid base64 payload: {e}")))?;
    Ok(MediaAsset::new(bytes, mime))
}

// ─── In-memory object store ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Object store kept in memory; serves public URLs under `base_url`.
pub struct MemoryObjectStore {
    base_url: String,
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    reject_uploads: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
            reject_uploads: AtomicBool::new(false),
        }
    }

    /// Make every upload fail, as an unconfigured store would.
    pub fn reject_uploads(&self, reject: bool) {
        self.reject_uploads.store(reject, Ordering::SeqCst);
    }

    pub async fn get(&self, bucket: &str, path: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}{PUBLIC_OBJECT_PREFIX}{bucket}/{}",
            self.base_url,
            utf8_percent_encode(path, PATH_SEGMENT)
        )
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("http://localhost:54321")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> StoreResult<String> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::Media(
                "object store not configured or invalid credentials".into(),
            ));
        }
        self.objects.write().await.insert(
            (bucket.to_string(), path.to_string()),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(self.public_url(bucket, path))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }
}
