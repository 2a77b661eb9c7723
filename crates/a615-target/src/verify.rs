//! Image checks run after a load has been downloaded.
//!
//! A load image is laid out as a 40-byte header holding the target part
//! number (ASCII, NUL padded), the payload, and a trailing SHA-256 digest of
//! the payload.

use anyhow::Context;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::error::{Result, TargetError};
use crate::event::{Event, EventKind, EventSender};

pub const IMAGE_HEADER_LEN: usize = 40;
pub const IMAGE_DIGEST_LEN: usize = 32;

pub trait ImageVerifier: Send + Sync {
    fn verify_integrity(&self, image: &Path) -> Result<bool>;
    fn verify_part_number(&self, image: &Path) -> Result<bool>;
    fn verify_format(&self, image: &Path) -> Result<bool>;
}

/// Checks images against the device part number using SHA-256.
pub struct Sha256ImageVerifier {
    part_number: String,
}

impl Sha256ImageVerifier {
    pub fn new(part_number: impl Into<String>) -> Self {
        Self {
            part_number: part_number.into(),
        }
    }

    fn read_header(image: &Path) -> anyhow::Result<Option<[u8; IMAGE_HEADER_LEN]>> {
        let mut file =
            File::open(image).with_context(|| format!("opening image {}", image.display()))?;
        let mut header = [0u8; IMAGE_HEADER_LEN];
        match file.read_exact(&mut header) {
            Ok(()) => Ok(Some(header)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading header of {}", image.display())),
        }
    }

    fn header_part_number(header: &[u8; IMAGE_HEADER_LEN]) -> Option<&str> {
        let end = header.iter().position(|&b| b == 0).unwrap_or(IMAGE_HEADER_LEN);
        // Padding after the part number must be all NUL.
        if header[end..].iter().any(|&b| b != 0) {
            return None;
        }
        let text = std::str::from_utf8(&header[..end]).ok()?;
        (!text.is_empty() && text.chars().all(|c| c.is_ascii_graphic())).then_some(text)
    }

    fn digest_matches(image: &Path) -> anyhow::Result<bool> {
        let mut file =
            File::open(image).with_context(|| format!("opening image {}", image.display()))?;
        let len = file.metadata()?.len();
        let overhead = (IMAGE_HEADER_LEN + IMAGE_DIGEST_LEN) as u64;
        if len < overhead {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(IMAGE_HEADER_LEN as u64))?;
        let mut hasher = Sha256::new();
        let mut payload = (&mut file).take(len - overhead);
        std::io::copy(&mut payload, &mut hasher)
            .with_context(|| format!("hashing {}", image.display()))?;
        let computed = hasher.finalize();

        let mut expected = [0u8; IMAGE_DIGEST_LEN];
        file.read_exact(&mut expected)?;
        debug!(
            "Image {} digest {} (expected {})",
            image.display(),
            hex::encode(computed),
            hex::encode(expected)
        );
        Ok(computed.as_slice() == expected.as_slice())
    }
}

impl ImageVerifier for Sha256ImageVerifier {
    fn verify_integrity(&self, image: &Path) -> Result<bool> {
        Ok(Self::digest_matches(image)?)
    }

    fn verify_part_number(&self, image: &Path) -> Result<bool> {
        let header = Self::read_header(image)?;
        Ok(header
            .as_ref()
            .and_then(Self::header_part_number)
            .is_some_and(|pn| pn == self.part_number))
    }

    fn verify_format(&self, image: &Path) -> Result<bool> {
        let len = std::fs::metadata(image)?.len();
        if len <= (IMAGE_HEADER_LEN + IMAGE_DIGEST_LEN) as u64 {
            return Ok(false);
        }
        let header = Self::read_header(image)?;
        Ok(header.as_ref().and_then(Self::header_part_number).is_some())
    }
}

/// Builds an image in the layout the verifier expects.
pub fn package_image(part_number: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if part_number.is_empty() || part_number.len() > IMAGE_HEADER_LEN {
        return Err(TargetError::Config(format!(
            "part number must be 1-{} bytes",
            IMAGE_HEADER_LEN
        )));
    }
    let mut image = Vec::with_capacity(IMAGE_HEADER_LEN + payload.len() + IMAGE_DIGEST_LEN);
    image.extend_from_slice(part_number.as_bytes());
    image.resize(IMAGE_HEADER_LEN, 0);
    image.extend_from_slice(payload);
    image.extend_from_slice(&Sha256::digest(payload));
    Ok(image)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub format_ok: bool,
    pub pn_ok: bool,
    pub hash_ok: bool,
}

impl VerificationReport {
    /// Runs all checks; an error counts as a failed check.
    pub fn collect(verifier: &dyn ImageVerifier, image: &Path) -> Self {
        let check = |name: &str, result: Result<bool>| match result {
            Ok(passed) => passed,
            Err(e) => {
                warn!("{} check of {} failed: {}", name, image.display(), e);
                false
            }
        };
        Self {
            format_ok: check("format", verifier.verify_format(image)),
            pn_ok: check("part number", verifier.verify_part_number(image)),
            hash_ok: check("integrity", verifier.verify_integrity(image)),
        }
    }

    pub fn passed(&self) -> bool {
        self.format_ok && self.pn_ok && self.hash_ok
    }

    /// One result event per check, format first.
    pub fn events(&self) -> [EventKind; 3] {
        [
            if self.format_ok {
                EventKind::SecImgFormatOk
            } else {
                EventKind::SecErrImgBadFormat
            },
            if self.pn_ok {
                EventKind::SecImgPnOk
            } else {
                EventKind::SecErrImgPnMismatch
            },
            if self.hash_ok {
                EventKind::SecImgHashOk
            } else {
                EventKind::SecErrImgHashMismatch
            },
        ]
    }
}

/// Verifies `image` off the async workers and posts the result events.
pub async fn run_verification(
    verifier: Arc<dyn ImageVerifier>,
    image: PathBuf,
    events: EventSender,
) -> Result<VerificationReport> {
    let path = image.clone();
    let report =
        tokio::task::spawn_blocking(move || VerificationReport::collect(verifier.as_ref(), &path))
            .await
            .map_err(|e| anyhow::anyhow!("verification task failed: {e}"))?;

    if report.passed() {
        info!("Image {} passed verification", image.display());
    } else {
        warn!("Image {} failed verification: {:?}", image.display(), report);
    }
    AuditLogger::verification_result(&image.display().to_string(), &report);

    for kind in report.events() {
        let event = Event::new(kind, format!("{}", image.display()));
        if let Err(e) = events.post(event).await {
            error!("Could not report verification result: {}", e);
        }
    }
    Ok(report)
}
