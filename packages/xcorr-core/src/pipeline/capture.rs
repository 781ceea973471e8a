// Capture loop
//
// Runs on a blocking task for the lifetime of a connection. While capture is
// enabled it pulls one frame (or one device-driven scan) at a time, holding
// the frame lock for reading so configuration changes land between frames.

use super::Session;
use crate::accumulator::Accumulator;
use crate::buffer::SampleBuffer;
use crate::error::XcResult;
use crate::mode::{OperatingMode, SessionMode};
use crate::reduction::faulted;
use crate::series::{ChannelSeries, SeriesKey};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(super) fn run(session: Arc<Session>) {
    log::info!("Capture loop started");
    let idle_poll = Duration::from_millis(session.config.idle_poll_ms.max(1));
    let mut buffer: Option<SampleBuffer> = None;

    loop {
        if session.cancel.is_cancelled() {
            break;
        }
        if !session.gate.wait_enabled(idle_poll) {
            continue;
        }

        // Progress restarts here; an interrupt issued after this point stops the next scan
        session.scan.reset();
        let frame = session.frame_lock.blocking_read();
        if session.cancel.is_cancelled() {
            break;
        }
        if !session.gate.is_enabled() {
            continue;
        }

        let mode = session.mode();
        let result = if mode.is_batch_scan() {
            scan_once(&session, mode, &mut buffer)
        } else {
            frame_once(&session, mode)
        };
        drop(frame);

        match result {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                session.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Skipping frame: {}", e);
            }
            Err(e) => {
                session.connection_lost(&e);
                break;
            }
        }
    }

    log::info!("Capture loop stopped");
}

/// Read one packet and fold it into the accumulator
fn frame_once(session: &Session, mode: SessionMode) -> XcResult<()> {
    let frame = session.device.lock().read_frame()?;
    session.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
    let geometry = session.geometry;

    match mode.base() {
        OperatingMode::Counter => {
            let mut accumulator = session.accumulator.lock();
            for line in 0..geometry.num_lines {
                match frame.counts.get(line) {
                    Some(count) => accumulator.record_count(line, *count),
                    None => log::debug!("Frame carries no count for line {}", line),
                }
            }
            publish_channels(session, mode, accumulator, (0..geometry.num_lines).collect());
        }
        OperatingMode::Autocorrelator | OperatingMode::Crosscorrelator => {
            let spacing = session.spacing_ns();
            let bins = session.reducer.extract_live(&frame, &geometry, mode, spacing);

            let mut accumulator = session.accumulator.lock();
            let mut completed = Vec::new();
            for (channel, channel_bins) in bins.iter().enumerate() {
                let missing = faulted(channel_bins);
                if missing > 0 {
                    log::debug!("Channel {}: skipped {} malformed samples", channel, missing);
                }
                if accumulator.stack_frame(channel, channel_bins) {
                    completed.push(channel);
                }
            }
            if !completed.is_empty() {
                publish_channels(session, mode, accumulator, completed);
            }
        }
    }
    Ok(())
}

/// Run one device-driven scan into the current-generation buffer
fn scan_once(session: &Session, mode: SessionMode, buffer: &mut Option<SampleBuffer>) -> XcResult<()> {
    let layout = session.layout.current();
    if buffer
        .as_ref()
        .map_or(true, |b| b.generation() != layout.generation)
    {
        *buffer = Some(SampleBuffer::allocate(Arc::clone(&layout)));
    }
    let Some(buffer) = buffer.as_mut() else {
        return Ok(());
    };

    let stack = session.stack.load(Ordering::Acquire);
    {
        let mut device = session.device.lock();
        match mode.base() {
            OperatingMode::Autocorrelator => {
                device.scan_autocorrelations(buffer.autocorrelations_mut(), stack, &session.scan)?
            }
            OperatingMode::Crosscorrelator => {
                device.scan_crosscorrelations(buffer.crosscorrelations_mut(), stack, &session.scan)?
            }
            OperatingMode::Counter => return Ok(()),
        };
    }

    if session.scan.is_interrupted() {
        session.stats.scans_interrupted.fetch_add(1, Ordering::Relaxed);
        log::debug!("Scan interrupted at {:.0}%, discarding", session.scan.percent());
        return Ok(());
    }
    session.stats.scans_completed.fetch_add(1, Ordering::Relaxed);

    let spacing = session.geometry.sample_spacing_ns(layout.time_scale);
    let bins = session.reducer.extract_scan(buffer, mode, spacing);

    let mut accumulator = session.accumulator.lock();
    for (channel, channel_bins) in bins.iter().enumerate() {
        let missing = faulted(channel_bins);
        if missing > 0 {
            log::debug!("Channel {}: skipped {} malformed samples", channel, missing);
        }
        accumulator.stack_scan(channel, channel_bins);
    }
    let channels = (0..accumulator.channel_count()).collect();
    publish_channels(session, mode, accumulator, channels);
    Ok(())
}

/// Write the corrected series of `channels`, and their variants, to the store.
///
/// The accumulator lock is released before the variants are derived.
fn publish_channels(
    session: &Session,
    mode: SessionMode,
    accumulator: MutexGuard<'_, Accumulator>,
    channels: Vec<usize>,
) {
    let window = session.config.counter_window_secs;
    let plains: Vec<(usize, ChannelSeries)> = channels
        .into_iter()
        .map(|channel| (channel, accumulator.corrected(channel, window)))
        .collect();
    drop(accumulator);

    let spacing = session.spacing_ns();
    for (channel, variants) in session.reducer.derive_variants(mode, spacing, plains) {
        for (kind, series) in variants {
            session.store.publish(SeriesKey::new(channel, kind), series);
        }
    }
}
