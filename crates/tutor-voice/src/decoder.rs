//! Little-endian s16 PCM to normalized f32, tolerant of chunk boundaries that
//! split a sample.

/// Scale for normalizing i16 samples to [-1.0, 1.0).
const I16_SCALE: f32 = 32768.0;

/// Decode one chunk with an optional carried-over byte.
///
/// Returns the decoded samples and the new residual (the trailing byte when the
/// combined length is odd).
pub fn decode_pcm16le(chunk: &[u8], residual: Option<u8>) -> (Vec<f32>, Option<u8>) {
    let total = chunk.len() + usize::from(residual.is_some());
    let mut samples = Vec::with_capacity(total / 2);

    let mut rest = chunk;
    if let Some(low) = residual {
        match rest.split_first() {
            Some((&high, tail)) => {
                samples.push(normalize([low, high]));
                rest = tail;
            }
            None => return (samples, Some(low)),
        }
    }

    let mut pairs = rest.chunks_exact(2);
    for pair in &mut pairs {
        samples.push(normalize([pair[0], pair[1]]));
    }
    let new_residual = pairs.remainder().first().copied();

    (samples, new_residual)
}

fn normalize(bytes: [u8; 2]) -> f32 {
    i16::from_le_bytes(bytes) as f32 / I16_SCALE
}

/// Stateful decoder for one PCM byte stream. Chunks must be fed in arrival order.
#[derive(Debug, Default, Clone)]
pub struct SampleDecoder {
    residual: Option<u8>,
}

impl SampleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Vec<f32> {
        let (samples, residual) = decode_pcm16le(chunk, self.residual.take());
        self.residual = residual;
        samples
    }

    /// Byte held over from the previous chunk, if any.
    pub fn residual(&self) -> Option<u8> {
        self.residual
    }

    /// Drop any held-over byte (new stream or barge-in).
    pub fn reset(&mut self) {
        self.residual = None;
    }
}
