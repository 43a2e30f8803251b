//! Realtek patch images and configuration blobs.
//!
//! An image is a 16-byte little-endian header followed by raw patch bytes:
//!
//! ```text
//! [signature: "Realtech"] [version: u16] [patch_count: u16] [patch_length: u32] [patch...]
//! ```
//!
//! The patch is transferred in fragments of at most [`MAX_FRAGMENT_LEN`]
//! bytes, see [`loader`].

pub mod loader;

use std::{fmt, fs, io, path::Path};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub use loader::load;

pub const SIGNATURE: &[u8; 8] = b"Realtech";
pub const HEADER_LEN: usize = 16;

/// Most patch bytes carried by one download command.
pub const MAX_FRAGMENT_LEN: usize = 252;

/// Most configuration bytes one config write command can carry.
pub const MAX_CONFIG_LEN: usize = 253;

const PATCH_INDEX: u8 = 0x01;
const CONFIG_TAG: u8 = 0x08;

/// A validated firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    version: u16,
    patch_count: u16,
    patch_length: u32,
    patch: Bytes,
}

impl FirmwareImage {
    /// Validate the header of `data` and split off the patch.
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidFirmware(format!(
                "image is {} bytes, shorter than its header",
                data.len()
            )));
        }

        if &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(Error::InvalidFirmware("bad signature".into()));
        }

        let mut header = &data[SIGNATURE.len()..HEADER_LEN];
        let version = header.get_u16_le();
        let patch_count = header.get_u16_le();
        let patch_length = header.get_u32_le();

        let patch = data.slice(HEADER_LEN..);
        if patch.is_empty() {
            return Err(Error::InvalidFirmware("image has no patch data".into()));
        }

        // The transfer length is whatever follows the header
        if patch_length as usize != patch.len() {
            warn!(
                declared = patch_length,
                actual = patch.len(),
                "Patch length in header disagrees with image size"
            );
        }

        Ok(Self {
            version,
            patch_count,
            patch_length,
            patch,
        })
    }

    /// Read and validate the image at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|source| Error::FirmwareUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        let image = Self::parse(Bytes::from(data))?;
        info!(
            path = %path.display(),
            version = image.version,
            patch_count = image.patch_count,
            patch_length = image.patch_length,
            "Firmware image loaded"
        );
        Ok(image)
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn patch_count(&self) -> u16 {
        self.patch_count
    }

    /// Patch length as declared in the header.
    pub fn patch_length(&self) -> u32 {
        self.patch_length
    }

    /// Patch bytes as they will be transferred.
    pub fn patch(&self) -> &Bytes {
        &self.patch
    }

    /// Split the patch into download fragments in transfer order.
    pub fn fragments(&self) -> impl Iterator<Item = Fragment> + '_ {
        (0..self.patch.len())
            .step_by(MAX_FRAGMENT_LEN)
            .map(move |start| {
                let end = (start + MAX_FRAGMENT_LEN).min(self.patch.len());
                Fragment {
                    offset: HEADER_LEN + start,
                    continuation: start > 0,
                    bytes: self.patch.slice(start..end),
                }
            })
    }
}

/// One slice of the patch and where it came from in the image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Offset of the first byte within the image file
    pub offset: usize,
    /// False only for the first fragment
    pub continuation: bool,
    pub bytes: Bytes,
}

impl Fragment {
    /// Parameters of the patch download command carrying this fragment.
    pub fn params(&self) -> Bytes {
        let mut params = BytesMut::with_capacity(3 + self.bytes.len());
        params.put_u8(PATCH_INDEX);
        params.put_u8(self.bytes.len() as u8 + 1);
        params.put_u8(self.continuation as u8);
        params.put_slice(&self.bytes);
        params.freeze()
    }
}

/// Configuration overlay written after the patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob(Bytes);

impl ConfigBlob {
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() > MAX_CONFIG_LEN {
            return Err(Error::InvalidConfig {
                len: data.len(),
                max: MAX_CONFIG_LEN,
            });
        }
        Ok(Self(data))
    }

    /// Read the blob at `path`.
    ///
    /// A blob that is missing, empty, unreadable or too large means no
    /// overlay; only the last two are worth a warning.
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config blob");
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Config blob unreadable, continuing without it"
                );
                return Ok(None);
            }
        };

        if data.is_empty() {
            return Ok(None);
        }

        match Self::new(Bytes::from(data)) {
            Ok(blob) => {
                info!(path = %path.display(), len = blob.len(), "Config blob loaded");
                Ok(Some(blob))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config blob ignored");
                Ok(None)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parameters of the config write command.
    pub fn params(&self) -> Bytes {
        let mut params = BytesMut::with_capacity(2 + self.0.len());
        params.put_u8(CONFIG_TAG);
        params.put_u8(self.0.len() as u8);
        params.put_slice(&self.0);
        params.freeze()
    }
}

/// Where in the load sequence a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    EnterDownload,
    Patch { offset: usize },
    Config,
    Launch,
}

impl fmt::Display for LoadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStep::EnterDownload => write!(f, "enter download mode"),
            LoadStep::Patch { offset } => write!(f, "patch fragment at offset {offset}"),
            LoadStep::Config => write!(f, "config write"),
            LoadStep::Launch => write!(f, "launch"),
        }
    }
}

/// Patch bytes acknowledged so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub sent: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.sent * 100 / self.total) as u8
    }
}
