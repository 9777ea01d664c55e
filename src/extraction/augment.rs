//! ノイズによる学習データの水増し

use rand::Rng;

/// 各要素に `[-amplitude, amplitude]` の一様ノイズを加え、[0, 1] に収める
pub fn jitter<R: Rng + ?Sized>(features: &[f32], amplitude: f32, rng: &mut R) -> Vec<f32> {
    if amplitude <= 0.0 {
        return features.to_vec();
    }
    features
        .iter()
        .map(|&v| (v + rng.gen_range(-amplitude..=amplitude)).clamp(0.0, 1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_jitter_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let features = vec![0.0, 0.5, 1.0, 0.01, 0.99];
        let noisy = jitter(&features, 0.1, &mut rng);
        assert_eq!(noisy.len(), features.len());
        for (a, b) in features.iter().zip(noisy.iter()) {
            assert!((0.0..=1.0).contains(b));
            assert!((a - b).abs() <= 0.1 + 1e-6);
        }
    }

    #[test]
    fn test_zero_amplitude_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let features = vec![0.25, 0.75];
        assert_eq!(jitter(&features, 0.0, &mut rng), features);
    }
}
