//! Upload over the characteristic-addressed channel.
//!
//! Control commands are plain ASCII written (acknowledged) to upload-control:
//! `BL_OTA START <size> <CRC32HEX>`, `BL_OTA ABORT` and `BL_OTA FINISH`. Data
//! goes unacknowledged to upload-data as frames of
//! `[u32 LE sequence][u16 LE length][payload]`, the sequence starting at 0.

use std::{
    thread,
    time::{Duration, Instant},
};

use log::{info, warn};

use super::{percent, progress_bar, TransferJob, TransferReport};
use crate::{
    channel::{close_quietly, CharacteristicChannel},
    error::{Error, Result},
    settings::Settings,
    utils::{status, Tone},
};

/// ATT write header.
const ATT_OVERHEAD: usize = 3;
/// Sequence number and length prefix of every data frame.
pub const FRAME_HEADER_LEN: usize = 6;
pub const MIN_PAYLOAD: usize = 8;
pub const MAX_PAYLOAD: usize = 180;

// =============================================================================
// Public Interface
// =============================================================================

/// Payload bytes per frame for a link with the given ATT MTU.
pub fn frame_payload_size(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_OVERHEAD + FRAME_HEADER_LEN)
        .clamp(MIN_PAYLOAD, MAX_PAYLOAD)
}

pub fn encode_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Run the START / frames / FINISH sequence. Any failure while starting or
/// streaming sends a best-effort `BL_OTA ABORT`.
pub fn upload(
    channel: &mut CharacteristicChannel,
    job: &TransferJob,
    settings: &Settings,
) -> Result<TransferReport> {
    if !channel.capabilities().supports_upload() {
        return Err(Error::NotSupported("upload endpoints on this device".into()));
    }

    let started = Instant::now();
    let payload = frame_payload_size(channel.mtu());
    status(
        Tone::Plain,
        format!(
            "[BLE-OTA] START size={} crc={} frame payload={}",
            job.size(),
            job.crc_hex(),
            payload
        ),
    );

    if let Err(e) = start_and_stream(channel, job, payload, settings) {
        close_quietly("BL_OTA ABORT", channel.write_control("BL_OTA ABORT"));
        status(Tone::Bad, format!("[BLE-OTA] aborted: {}", e));
        return Err(Error::ProtocolAbort(e.to_string()));
    }

    thread::sleep(settings.ble_ota_settle);
    let finish_confirmed = finish(channel, settings.ble_finish_retry_delay, settings.optimistic_finish)?;

    let report = TransferReport {
        bytes_sent: job.size(),
        elapsed: started.elapsed(),
        finish_confirmed,
    };
    status(
        Tone::Good,
        format!(
            "[BLE-OTA] {} bytes in {:.1}s ({:.1} KB/s), device rebooting",
            report.bytes_sent,
            report.elapsed.as_secs_f64(),
            report.kilobytes_per_second()
        ),
    );
    Ok(report)
}

// =============================================================================
// Private stuff
// =============================================================================

fn start_and_stream(
    channel: &mut CharacteristicChannel,
    job: &TransferJob,
    payload: usize,
    settings: &Settings,
) -> Result<()> {
    channel.write_control(&format!("BL_OTA START {} {}", job.size(), job.crc_hex()))?;

    let size = job.size();
    let bar = progress_bar(size, "[BLE-OTA]");
    let mut sent = 0;
    let mut last_report = 0;
    for (seq, chunk) in job.image().chunks(payload).enumerate() {
        if let Err(e) = channel.write_data(&encode_frame(seq as u32, chunk)) {
            bar.abandon();
            return Err(e);
        }
        sent += chunk.len();
        bar.set_position(sent as u64);
        if sent - last_report >= settings.ble_ota_progress_every || sent == size {
            info!("[BLE-OTA] {}/{} bytes ({}%)", sent, size, percent(sent, size));
            last_report = sent;
            // Let the notification listener run.
            thread::yield_now();
        }
    }
    bar.finish_with_message("frames sent");
    Ok(())
}

/// `Ok(true)` when FINISH was accepted, `Ok(false)` when it was not but the
/// optimistic policy applies.
fn finish(channel: &mut CharacteristicChannel, retry_delay: Duration, optimistic: bool) -> Result<bool> {
    match channel.write_control("BL_OTA FINISH") {
        Ok(()) => return Ok(true),
        Err(e) => warn!("[BLE-OTA] FINISH failed, retrying: {}", e),
    }
    thread::sleep(retry_delay);
    match channel.write_control("BL_OTA FINISH") {
        Ok(()) => Ok(true),
        Err(e) if optimistic => {
            warn!("[BLE-OTA] FINISH failed again ({}), assuming the device is rebooting", e);
            Ok(false)
        }
        Err(e) => Err(Error::ProtocolAbort(format!("FINISH not accepted: {}", e))),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
