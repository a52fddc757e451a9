//! Firmware upload, one protocol variant per transport.
//!
//! Both variants announce the image size and its CRC32 before sending any
//! data and neither can confirm that the device accepted the image: the
//! device verifies the checksum, and the real success signal is the device
//! coming back after its reboot.

pub mod characteristic;
pub mod stream;

use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// One firmware image, ready to be sent.
#[derive(Debug, Clone)]
pub struct TransferJob {
    name: String,
    image: Vec<u8>,
    crc32: u32,
}

impl TransferJob {
    pub fn new(name: impl Into<String>, image: Vec<u8>) -> Result<Self> {
        let name = name.into();
        if image.is_empty() {
            return Err(Error::InvalidImage(format!("`{}` is empty", name)));
        }
        // Both protocols carry the size in 32 bits.
        if image.len() > u32::MAX as usize {
            return Err(Error::InvalidImage(format!("`{}` is too big", name)));
        }
        let crc32 = crc32fast::hash(&image);
        debug!("image `{}`: {} bytes, crc32 {:08X}", name, image.len(), crc32);
        Ok(TransferJob { name, image, crc32 })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let image = fs::read(path)?;
        TransferJob::new(path.display().to_string(), image)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Eight uppercase hex digits, as announced in the upload headers.
    pub fn crc_hex(&self) -> String {
        format!("{:08X}", self.crc32)
    }
}

/// Outcome of a transfer that got all the data out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferReport {
    pub bytes_sent: usize,
    pub elapsed: Duration,
    /// Whether the device acknowledged the end of the transfer. `false` is
    /// still a success: the device may already be rebooting.
    pub finish_confirmed: bool,
}

impl TransferReport {
    pub fn kilobytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64().max(1e-3);
        self.bytes_sent as f64 / 1024.0 / secs
    }
}

/// Rejects a second upload while one is in flight.
#[derive(Debug, Clone, Default)]
pub struct TransferLock(Arc<AtomicBool>);

impl TransferLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<TransferGuard> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| TransferGuard(Arc::clone(&self.0)))
            .map_err(|_| Error::UploadInProgress)
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held for the duration of one upload; releases the lock when dropped.
#[derive(Debug)]
pub struct TransferGuard(Arc<AtomicBool>);

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn progress_bar(total: usize, tag: &str) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{} ⏩ Pushing [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{eta}})",
                tag
            ))
            .progress_chars("=>-"),
    );
    pb
}

fn percent(sent: usize, total: usize) -> usize {
    if total == 0 {
        100
    } else {
        sent * 100 / total
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn job_computes_crc() {
    let job = TransferJob::new("app.bin", b"123456789".to_vec()).unwrap();
    assert_eq!(job.crc32(), 0xCBF4_3926);
    assert_eq!(job.crc_hex(), "CBF43926");
    assert_eq!(job.size(), 9);
}

#[test]
fn empty_image_is_rejected() {
    assert!(matches!(
        TransferJob::new("empty.bin", vec![]),
        Err(Error::InvalidImage(_))
    ));
}

#[test]
fn missing_image_is_an_io_error() {
    let result = TransferJob::from_path(Path::new("/nonexistent/fieldcom/app.bin"));
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn lock_rejects_second_holder_until_released() {
    let lock = TransferLock::new();
    let guard = lock.try_acquire().unwrap();
    assert!(lock.is_busy());
    assert!(matches!(lock.clone().try_acquire(), Err(Error::UploadInProgress)));
    drop(guard);
    assert!(!lock.is_busy());
    assert!(lock.try_acquire().is_ok());
}

#[test]
fn throughput() {
    let report = TransferReport {
        bytes_sent: 512 * 1024,
        elapsed: Duration::from_secs(2),
        finish_confirmed: true,
    };
    assert!((report.kilobytes_per_second() - 256.0).abs() < 1e-9);
    assert_eq!(percent(50, 200), 25);
}
