// Band-limited resampling
// Offline sinc interpolation with rubato, delay-compensated to the exact output length

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::ingest::AudioError;

const CHUNK_SIZE: usize = 1024;

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Resample mono audio from `from_rate` to `to_rate`.
///
/// The output holds `round(len * to_rate / from_rate)` samples and is aligned
/// with the input (the filter delay is trimmed off the front).
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if from_rate == 0 {
        return Err(AudioError::InvalidSampleRate(from_rate));
    }
    if to_rate == 0 {
        return Err(AudioError::InvalidSampleRate(to_rate));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_parameters(), CHUNK_SIZE, 1)
        .map_err(|e| AudioError::Resample(format!("init: {e}")))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected + delay + CHUNK_SIZE);
    let mut chunks = samples.chunks(CHUNK_SIZE);

    // Zero chunks after the input flush the filter tail
    while output.len() < expected + delay {
        let mut block = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        block.resize(CHUNK_SIZE, 0.0);

        let resampled = resampler
            .process(&[block], None)
            .map_err(|e| AudioError::Resample(format!("process: {e}")))?;

        match resampled.first() {
            Some(channel) if !channel.is_empty() => output.extend_from_slice(channel),
            _ => return Err(AudioError::Resample("resampler produced no output".to_string())),
        }
    }

    output.drain(..delay);
    output.truncate(expected);

    log::debug!(
        "Resampled {} samples at {} Hz to {} samples at {} Hz",
        samples.len(),
        from_rate,
        output.len(),
        to_rate
    );

    Ok(output)
}
