// Mono sample buffer
// The unit handed from the decoder to the featurizer

use super::ingest::AudioError;

/// Mono f32 samples at a fixed sample rate. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Wrap mono samples. Rejects an empty buffer or a zero sample rate.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate(sample_rate));
        }
        if samples.is_empty() {
            return Err(AudioError::InvalidData);
        }
        Ok(SampleBuffer {
            samples,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false for a constructed buffer
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            SampleBuffer::new(vec![], 16000),
            Err(AudioError::InvalidData)
        ));
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(matches!(
            SampleBuffer::new(vec![0.0], 0),
            Err(AudioError::InvalidSampleRate(0))
        ));
    }

    #[test]
    fn test_duration() {
        let buffer = SampleBuffer::new(vec![0.0; 8000], 16000).unwrap();
        assert_eq!(buffer.len(), 8000);
        assert!(!buffer.is_empty());
        assert!((buffer.duration_secs() - 0.5).abs() < 1e-9);
    }
}
