//! CPAL output stream and its real-time callback.
//!
//! The callback:
//! - refills a small local buffer from the [`SampleQueue`] without waiting
//! - maps source channels onto the device channels (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format
//! - counts played frames, which the CPAL worker compares against buffer end marks

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::DeviceTrait;

use crate::error::{PlayerError, Result};
use crate::queue::SampleQueue;
use crate::status::OutputCounters;

/// Build a CPAL output stream that plays audio from `queue`.
///
/// `queue` must carry interleaved `f32` samples at the stream's sample rate.
/// Underruns are filled with silence and counted; while paused the callback outputs
/// silence without draining the queue.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    counters: &Arc<OutputCounters>,
    refill_max_frames: usize,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, counters, refill_max_frames),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, counters, refill_max_frames),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, counters, refill_max_frames),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, counters, refill_max_frames),
        other => Err(PlayerError::DeviceConfig(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    counters: &Arc<OutputCounters>,
    refill_max_frames: usize,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = (config.channels as usize).max(1);
    let state = Mutex::new(CallbackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::with_capacity(refill_max_frames.max(1) * queue.channels()),
    });

    let refill_max_frames = refill_max_frames.max(1);
    let queue = queue.clone();
    let counters = counters.clone();

    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if counters.paused.load(Ordering::Relaxed) {
                    fill_silence(data);
                    return;
                }

                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                let frames = data.len() / channels_out;
                let mut filled_frames = 0usize;

                for frame in 0..frames {
                    if st.pos >= st.src.len() {
                        st.pos = 0;
                        let CallbackState { src, .. } = &mut *st;
                        if queue.pop_into(src, refill_max_frames) == 0 {
                            counters.underrun_events.fetch_add(1, Ordering::Relaxed);
                            let remaining = frames.saturating_sub(frame);
                            counters
                                .underrun_frames
                                .fetch_add(remaining as u64, Ordering::Relaxed);
                            fill_silence(&mut data[frame * channels_out..]);
                            break;
                        }
                    }
                    for ch in 0..channels_out {
                        let sample = next_sample_mapped(&mut st, channels_out, ch);
                        data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                    filled_frames += 1;
                }

                if filled_frames > 0 {
                    counters
                        .played_frames
                        .fetch_add(filled_frames as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(|err| PlayerError::DeviceConfig(format!("build output stream: {err}")))?;

    Ok(stream)
}

fn fill_silence<T>(data: &mut [T])
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
    data.fill(silence);
}

/// Samples fetched from the queue but not yet written to the device.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available source channels
///
/// `st.pos` advances once per destination frame, after the last channel.
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
