// Audio processing module
// Decoding, resampling and mel spectrogram extraction

pub mod buffer;
pub mod decode;
pub mod ingest;
pub mod mel;
pub mod resample;
pub mod spectrogram;

pub use buffer::SampleBuffer;
pub use decode::{synthetic_click_train, AudioDecoder, DecodeStatus, DecodedAudio};
pub use ingest::{ingest_wav, AudioError, PcmAudio};
pub use mel::MelFilterBank;
pub use resample::resample;
pub use spectrogram::{FeatureConfig, FeatureError, SpectralFeaturizer, Spectrogram};
