//! Evidence storage for violation snapshots.
//!
//! Objects are keyed
//! `violations/<device>/<YYYY>/<MM>/<DD>/<HHMMSS>_<micros>_<class>.jpg`, so each
//! violation class accepted on one frame gets its own object.
//! A sink returns the location of the stored object; callers treat any error as
//! "no evidence" and still send the alert.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use url::Url;

use crate::Timestamp;

pub const EVIDENCE_PREFIX: &str = "violations";

/// Storage for annotated violation images.
pub trait EvidenceSink: Send {
    fn name(&self) -> &'static str;

    /// Store one JPEG and return its location.
    fn store(
        &mut self,
        jpeg: &[u8],
        device_id: &str,
        timestamp: Timestamp,
        class_name: &str,
    ) -> Result<String>;
}

/// Object key for a `class_name` snapshot taken at `timestamp`.
pub fn evidence_key(device_id: &str, timestamp: Timestamp, class_name: &str) -> String {
    format!(
        "{}/{}/{}/{}_{}.jpg",
        EVIDENCE_PREFIX,
        device_id,
        timestamp.format("%Y/%m/%d"),
        timestamp.format("%H%M%S_%6f"),
        class_name
    )
}

/// Store through `sink`, logging failures. `None` when there is no sink or storing failed.
pub fn store_evidence(
    sink: Option<&mut (dyn EvidenceSink + '_)>,
    jpeg: &[u8],
    device_id: &str,
    timestamp: Timestamp,
    class_name: &str,
) -> Option<String> {
    let sink = sink?;
    match sink.store(jpeg, device_id, timestamp, class_name) {
        Ok(location) => {
            log::info!("evidence stored: {}", location);
            Some(location)
        }
        Err(e) => {
            log::warn!("{} evidence store failed: {:#}", sink.name(), e);
            None
        }
    }
}

/// Writes snapshots below a local directory and returns `file://` URLs.
pub struct FsEvidenceSink {
    root: PathBuf,
}

impl FsEvidenceSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("create evidence dir {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve evidence dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl EvidenceSink for FsEvidenceSink {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn store(
        &mut self,
        jpeg: &[u8],
        device_id: &str,
        timestamp: Timestamp,
        class_name: &str,
    ) -> Result<String> {
        let path = self.root.join(evidence_key(device_id, timestamp, class_name));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))?;
        let url = Url::from_file_path(&path)
            .map_err(|_| anyhow!("evidence path {} is not absolute", path.display()))?;
        Ok(url.to_string())
    }
}

/// Uploads snapshots with HTTP PUT below a base URL.
#[cfg(feature = "evidence-http")]
pub struct HttpEvidenceSink {
    base: Url,
    timeout: std::time::Duration,
}

#[cfg(feature = "evidence-http")]
impl HttpEvidenceSink {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("parse evidence url {}", base_url))?;
        match base.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported evidence url scheme '{}'", other)),
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            timeout: std::time::Duration::from_secs(10),
        })
    }

    pub fn object_url(&self, device_id: &str, timestamp: Timestamp, class_name: &str) -> Result<Url> {
        self.base
            .join(&evidence_key(device_id, timestamp, class_name))
            .context("build evidence object url")
    }
}

#[cfg(feature = "evidence-http")]
impl EvidenceSink for HttpEvidenceSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn store(
        &mut self,
        jpeg: &[u8],
        device_id: &str,
        timestamp: Timestamp,
        class_name: &str,
    ) -> Result<String> {
        let url = self.object_url(device_id, timestamp, class_name)?;
        ureq::put(url.as_str())
            .timeout(self.timeout)
            .set("Content-Type", "image/jpeg")
            .set("X-Device-Id", device_id)
            .set("X-Timestamp", &timestamp.to_rfc3339())
            .send_bytes(jpeg)
            .map_err(|e| anyhow!("PUT {} failed: {}", url, e))?;
        Ok(url.to_string())
    }
}

/// Build the configured sink. A directory takes precedence over an HTTP URL.
pub fn create_sink(dir: Option<&Path>, http_url: Option<&str>) -> Result<Option<Box<dyn EvidenceSink>>> {
    if let Some(dir) = dir {
        return Ok(Some(Box::new(FsEvidenceSink::new(dir)?)));
    }
    match http_url {
        None => Ok(None),
        #[cfg(feature = "evidence-http")]
        Some(url) => Ok(Some(Box::new(HttpEvidenceSink::new(url)?))),
        #[cfg(not(feature = "evidence-http"))]
        Some(url) => Err(anyhow!(
            "evidence url {} requires the evidence-http feature",
            url
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 15).unwrap() + chrono::TimeDelta::microseconds(42)
    }

    #[test]
    fn key_layout() {
        assert_eq!(
            evidence_key("dev-1", ts(), "no_mask"),
            "violations/dev-1/2024/05/01/083015_000042_no_mask.jpg"
        );
    }

    #[test]
    fn filesystem_sink_writes_and_returns_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FsEvidenceSink::new(dir.path()).unwrap();
        let location = sink
            .store(b"\xFF\xD8jpeg", "dev-1", ts(), "no_hardhat")
            .unwrap();
        assert!(location.starts_with("file://"));
        assert!(location.ends_with("violations/dev-1/2024/05/01/083015_000042_no_hardhat.jpg"));

        let written = sink.root().join(evidence_key("dev-1", ts(), "no_hardhat"));
        assert_eq!(std::fs::read(written).unwrap(), b"\xFF\xD8jpeg");
    }

    #[test]
    fn same_instant_different_classes_get_distinct_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FsEvidenceSink::new(dir.path()).unwrap();
        let hardhat = sink.store(b"hardhat", "dev-1", ts(), "no_hardhat").unwrap();
        let mask = sink.store(b"mask", "dev-1", ts(), "no_mask").unwrap();
        assert_ne!(hardhat, mask);
        let day = sink.root().join("violations/dev-1/2024/05/01");
        assert_eq!(std::fs::read_dir(day).unwrap().count(), 2);
    }

    #[test]
    fn missing_sink_yields_none() {
        assert_eq!(store_evidence(None, b"x", "dev", ts(), "no_mask"), None);
    }

    #[test]
    fn failing_sink_yields_none() {
        struct Broken;
        impl EvidenceSink for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn store(&mut self, _: &[u8], _: &str, _: Timestamp, _: &str) -> Result<String> {
                Err(anyhow!("disk full"))
            }
        }
        let mut sink = Broken;
        assert_eq!(
            store_evidence(Some(&mut sink), b"x", "dev", ts(), "no_mask"),
            None
        );
    }

    #[test]
    fn no_configuration_means_no_sink() {
        assert!(create_sink(None, None).unwrap().is_none());
    }
}
