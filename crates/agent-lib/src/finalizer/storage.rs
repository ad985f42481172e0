//! Object storage for log bundles
//!
//! The store hands out time-limited GET URLs. The local implementation keeps
//! objects on disk and signs URLs with HMAC-SHA256 over the decoded bucket,
//! key and expiry.

use crate::error::GlideinError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Put-object and presigned retrieval
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Retrieval URL valid for `ttl`
    fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<Url>;

    /// Fetch an object through a URL produced by `presign_get`
    async fn get_signed(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Filesystem-backed store whose URLs are served by the agent API under
/// `{base_url}/objects/{bucket}/{key}`
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    base_url: Url,
    secret: String,
}

/// Components of a presigned URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedObject {
    pub bucket: String,
    pub key: String,
    pub expires: i64,
    pub signature: String,
}

fn validate_object_path(bucket: &str, key: &str) -> std::result::Result<PathBuf, GlideinError> {
    let mut path = PathBuf::new();
    for part in [bucket, key] {
        let candidate = Path::new(part);
        let normal = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if part.is_empty() || !normal {
            return Err(GlideinError::InvalidSignature(format!(
                "invalid object path {bucket}/{key}"
            )));
        }
        path.push(candidate);
    }
    Ok(path)
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: Url, secret: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url,
            secret: secret.into(),
        }
    }

    fn mac(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
    ) -> std::result::Result<Hmac<Sha256>, GlideinError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| GlideinError::InvalidSignature(format!("signing key rejected: {e}")))?;
        mac.update(bucket.as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn sign(&self, bucket: &str, key: &str, expires: i64) -> std::result::Result<String, GlideinError> {
        Ok(hex::encode(self.mac(bucket, key, expires)?.finalize().into_bytes()))
    }

    /// Check a signature and expiry; on success returns the on-disk path
    pub fn verify(
        &self,
        object: &SignedObject,
        now: i64,
    ) -> std::result::Result<PathBuf, GlideinError> {
        let relative = validate_object_path(&object.bucket, &object.key)?;
        if object.expires < now {
            return Err(GlideinError::InvalidSignature(format!(
                "url for {}/{} expired",
                object.bucket, object.key
            )));
        }
        let mac = self.mac(&object.bucket, &object.key, object.expires)?;
        let matches = hex::decode(&object.signature)
            .is_ok_and(|signature| mac.verify_slice(&signature).is_ok());
        if !matches {
            return Err(GlideinError::InvalidSignature(format!(
                "bad signature for {}/{}",
                object.bucket, object.key
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Split a presigned URL back into its parts
    pub fn parse_url(&self, url: &Url) -> std::result::Result<SignedObject, GlideinError> {
        let invalid = || GlideinError::InvalidSignature(url.to_string());
        let mut segments = url.path_segments().ok_or_else(invalid)?;
        segments
            .by_ref()
            .find(|s| *s == "objects")
            .ok_or_else(invalid)?;
        let decode = |segment: &str| {
            percent_decode_str(segment)
                .decode_utf8()
                .map(|s| s.into_owned())
                .map_err(|_| invalid())
        };
        let bucket = decode(segments.next().ok_or_else(invalid)?)?;
        let key = segments.map(decode).collect::<std::result::Result<Vec<_>, _>>()?.join("/");

        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "expires" => expires = value.parse::<i64>().ok(),
                "signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(SignedObject {
            bucket,
            key,
            expires: expires.ok_or_else(invalid)?,
            signature: signature.ok_or_else(invalid)?,
        })
    }

    /// Read a verified object
    pub async fn read_verified(&self, object: &SignedObject) -> Result<Vec<u8>> {
        let path = self.verify(object, chrono::Utc::now().timestamp())?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object {}", path.display()))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.root.join(validate_object_path(bucket, key)?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // write then rename so readers never observe a partial object
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<Url> {
        validate_object_path(bucket, key)?;
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign(bucket, key, expires)?;

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Base URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .push("objects")
            .push(bucket)
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url)
    }

    async fn get_signed(&self, url: &Url) -> Result<Vec<u8>> {
        let object = self.parse_url(url)?;
        self.read_verified(&object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalObjectStore {
        LocalObjectStore::new(
            dir.path(),
            Url::parse("http://controller:8080/").unwrap(),
            "s3cr3t",
        )
    }

    #[tokio::test]
    async fn test_put_and_fetch_through_signed_url() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .put("pyglidein-logs", "logs/g-1.tar.gz", b"bundle".to_vec())
            .await
            .unwrap();
        let url = store
            .presign_get("pyglidein-logs", "logs/g-1.tar.gz", Duration::from_secs(600))
            .unwrap();

        assert!(url.path().starts_with("/objects/pyglidein-logs/logs/g-1.tar.gz"));
        assert_eq!(store.get_signed(&url).await.unwrap(), b"bundle");
    }

    #[tokio::test]
    async fn test_tampered_url_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("b", "k.tar.gz", b"x".to_vec()).await.unwrap();
        let url = store.presign_get("b", "k.tar.gz", Duration::from_secs(60)).unwrap();

        let mut object = store.parse_url(&url).unwrap();
        object.key = "other.tar.gz".to_string();
        assert!(matches!(
            store.verify(&object, 0),
            Err(GlideinError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_url_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let url = store.presign_get("b", "k", Duration::from_secs(60)).unwrap();
        let object = store.parse_url(&url).unwrap();

        let later = chrono::Utc::now().timestamp() + 3600;
        assert!(store.verify(&object, later).is_err());
    }

    #[tokio::test]
    async fn test_keys_with_spaces_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .put("pyglidein-logs", "log.Site A-1.tar.gz", b"bundle".to_vec())
            .await
            .unwrap();
        let url = store
            .presign_get("pyglidein-logs", "log.Site A-1.tar.gz", Duration::from_secs(60))
            .unwrap();

        assert!(url.path().contains("Site%20A"));
        assert_eq!(store.parse_url(&url).unwrap().key, "log.Site A-1.tar.gz");
        assert_eq!(store.get_signed(&url).await.unwrap(), b"bundle");
    }

    #[test]
    fn test_signature_is_keyed_hmac() {
        let dir = TempDir::new().unwrap();
        let object = SignedObject {
            bucket: "b".to_string(),
            key: "k".to_string(),
            expires: i64::MAX,
            signature: store(&dir).sign("b", "k", i64::MAX).unwrap(),
        };
        assert!(store(&dir).verify(&object, 0).is_ok());

        let other = LocalObjectStore::new(
            dir.path(),
            Url::parse("http://controller:8080/").unwrap(),
            "another-secret",
        );
        assert!(other.verify(&object, 0).is_err());

        let garbage = SignedObject {
            signature: "not-hex".to_string(),
            ..object
        };
        assert!(store(&dir).verify(&garbage, 0).is_err());
    }

    #[test]
    fn test_object_paths_cannot_escape_root() {
        assert!(validate_object_path("b", "../../etc/passwd").is_err());
        assert!(validate_object_path("b", "/etc/passwd").is_err());
        assert!(validate_object_path("", "k").is_err());
        assert!(validate_object_path("b", "logs/g-1.tar.gz").is_ok());
    }
}
