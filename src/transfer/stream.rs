//! Upload over the byte-stream channel.
//!
//! ```text
//! client                                   device
//!   | OTA <size> <CRC32HEX>\n                 |
//!   |---------------------------------------->|
//!   |                                ...ACK.. |
//!   |<----------------------------------------|
//!   | image, in chunks, no per-chunk reply    |
//!   |---------------------------------------->|
//!   | crc32 (4 bytes, little endian)          |
//!   |---------------------------------------->|
//!   |                   (optional) last words |
//!   |<----------------------------------------|
//! ```

use std::time::Instant;

use log::{debug, info};

use super::{percent, progress_bar, TransferJob, TransferReport};
use crate::{
    channel::{Channel, StreamChannel},
    error::{Error, Result},
    settings::Settings,
    utils::{status, Tone},
};

/// Run the upload and close the channel, whatever the outcome: the device
/// restarts after a transfer and the connection is stale either way.
pub fn upload(
    channel: &mut StreamChannel,
    job: &TransferJob,
    settings: &Settings,
) -> Result<TransferReport> {
    let result = push(channel, job, settings);
    channel.close();

    match &result {
        Ok(report) => status(
            Tone::Good,
            format!(
                "[OTA] {} bytes in {:.1}s ({:.1} KB/s)",
                report.bytes_sent,
                report.elapsed.as_secs_f64(),
                report.kilobytes_per_second()
            ),
        ),
        Err(e) => status(Tone::Bad, format!("[OTA] upload failed: {}", e)),
    }
    result
}

fn push(channel: &mut StreamChannel, job: &TransferJob, settings: &Settings) -> Result<TransferReport> {
    let size = job.size();
    let header = format!("OTA {} {}", size, job.crc_hex());
    status(Tone::Plain, format!("[OTA] {} ({})", header, job.name()));
    channel.write_line(&header)?;

    let reply = match channel.read_line(settings.ota_ack_timeout) {
        Ok(reply) => reply,
        Err(Error::Timeout(_)) => {
            return Err(Error::ProtocolAbort(format!(
                "no ACK within {:?}",
                settings.ota_ack_timeout
            )))
        }
        Err(e) => return Err(e),
    };
    if !reply.to_uppercase().contains("ACK") {
        return Err(Error::ProtocolAbort(format!("header refused: {}", reply)));
    }
    debug!("[OTA] header acknowledged: {}", reply);

    let started = Instant::now();
    let bar = progress_bar(size, "[OTA]");
    let mut sent = 0;
    let mut last_report = 0;
    for chunk in job.image().chunks(settings.ota_chunk_size.max(1)) {
        if let Err(e) = channel.write_bulk(chunk) {
            bar.abandon();
            return Err(e);
        }
        sent += chunk.len();
        bar.set_position(sent as u64);
        if sent - last_report >= settings.ota_progress_every || sent == size {
            info!("[OTA] {}/{} bytes ({}%)", sent, size, percent(sent, size));
            last_report = sent;
        }
    }
    channel.write_bulk(&job.crc32().to_le_bytes())?;
    bar.finish_with_message("image sent");

    // Advisory only: the device may reboot before saying anything.
    let finish_confirmed = match channel.read_line(settings.ota_final_read_timeout) {
        Ok(line) if !line.is_empty() => {
            status(Tone::Plain, format!("[OTA] device: {}", line));
            true
        }
        Ok(_) => false,
        Err(e) => {
            debug!("[OTA] no final reply: {}", e);
            false
        }
    };

    Ok(TransferReport {
        bytes_sent: sent,
        elapsed: started.elapsed(),
        finish_confirmed,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
