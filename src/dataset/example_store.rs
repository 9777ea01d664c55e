//! 学習データの保持とシャッフル
//!
//! 追加は O(1) で、シャッフル順は学習開始時に1回だけ計算します。

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{MlMapError, Result};
use crate::types::{Example, GeoBBox, Label, TrainingKey};

/// 学習データ（追加順に保持）
#[derive(Debug, Clone)]
pub struct ExampleStore {
    input_size: usize,
    examples: Vec<Example>,
}

impl ExampleStore {
    pub fn new(input_size: usize) -> Self {
        Self {
            input_size,
            examples: Vec::new(),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// 学習データを追加
    pub fn append(&mut self, key: TrainingKey, features: Vec<f32>, label: Label) -> Result<()> {
        if features.len() != self.input_size {
            return Err(MlMapError::FeatureLength {
                expected: self.input_size,
                actual: features.len(),
            });
        }
        self.examples.push(Example { key, features, label });
        Ok(())
    }

    /// 指定キーの学習データを削除し、削除件数を返す
    pub fn remove(&mut self, key: &TrainingKey) -> usize {
        let before = self.examples.len();
        self.examples.retain(|e| &e.key != key);
        before - self.examples.len()
    }

    /// 指定矩形から作られた学習データをすべて削除し、削除件数を返す
    pub fn remove_bbox(&mut self, bbox: &GeoBBox) -> usize {
        let before = self.examples.len();
        self.examples.retain(|e| &e.key.bbox != bbox);
        before - self.examples.len()
    }

    pub fn all(&self) -> &[Example] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn clear(&mut self) {
        self.examples.clear();
    }

    /// ラベルごとの件数 (not airplane, airplane)
    pub fn label_counts(&self) -> (usize, usize) {
        let positives = self.examples.iter().filter(|e| e.label == Label::Airplane).count();
        (self.examples.len() - positives, positives)
    }

    /// 1つの並べ替えを特徴とラベルの両方に適用したスナップショットを作る
    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> ShuffledProvider {
        let mut indices: Vec<usize> = (0..self.examples.len()).collect();
        indices.shuffle(rng);

        let mut keys = Vec::with_capacity(indices.len());
        let mut features = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for idx in indices {
            let example = &self.examples[idx];
            keys.push(example.key);
            features.push(example.features.clone());
            labels.push(example.label.target());
        }

        ShuffledProvider {
            input_size: self.input_size,
            keys,
            features,
            labels,
            cursor: 0,
        }
    }
}

/// シャッフル済みの入力・ターゲット供給器
///
/// i番目の特徴とi番目のラベルは常に同じ学習データに由来する。
#[derive(Debug, Clone)]
pub struct ShuffledProvider {
    input_size: usize,
    keys: Vec<TrainingKey>,
    features: Vec<Vec<f32>>,
    labels: Vec<f32>,
    cursor: usize,
}

impl ShuffledProvider {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn key(&self, i: usize) -> &TrainingKey {
        &self.keys[i]
    }

    pub fn features(&self, i: usize) -> &[f32] {
        &self.features[i]
    }

    pub fn label(&self, i: usize) -> f32 {
        self.labels[i]
    }

    /// 次のミニバッチを取り出す（末尾に達したら先頭に戻る）
    ///
    /// 戻り値: (平坦化した入力 [batch * input_size], ターゲット [batch])
    pub fn next_batch(&mut self, batch_size: usize) -> (Vec<f32>, Vec<f32>) {
        let n = self.len();
        if n == 0 || batch_size == 0 {
            return (Vec::new(), Vec::new());
        }

        let mut inputs = Vec::with_capacity(batch_size * self.input_size);
        let mut targets = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let i = self.cursor;
            inputs.extend_from_slice(&self.features[i]);
            targets.push(self.labels[i]);
            self.cursor = (self.cursor + 1) % n;
        }
        (inputs, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn key(i: u32) -> TrainingKey {
        TrainingKey::new(GeoBBox::new(i as f64, 0.0, i as f64 + 1.0, 1.0), i, 0)
    }

    /// 特徴の先頭要素に番号を埋め込み、ラベルは偶奇で決める
    fn filled_store(n: u32) -> ExampleStore {
        let mut store = ExampleStore::new(4);
        for i in 0..n {
            let label = if i % 2 == 0 { Label::Airplane } else { Label::NotAirplane };
            store.append(key(i), vec![i as f32, 0.0, 0.0, 0.0], label).unwrap();
        }
        store
    }

    #[test]
    fn test_append_rejects_wrong_length() {
        let mut store = ExampleStore::new(4);
        let result = store.append(key(0), vec![0.0; 3], Label::Airplane);
        assert!(matches!(result, Err(MlMapError::FeatureLength { expected: 4, actual: 3 })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_shuffle_keeps_pairs() {
        let store = filled_store(37);
        let mut rng = StdRng::seed_from_u64(42);
        let provider = store.shuffled(&mut rng);

        assert_eq!(provider.len(), 37);
        let mut seen: Vec<u32> = Vec::new();
        for i in 0..provider.len() {
            let id = provider.features(i)[0] as u32;
            let expected = if id % 2 == 0 { 1.0 } else { 0.0 };
            assert_eq!(provider.label(i), expected);
            assert_eq!(provider.key(i), &key(id));
            seen.push(id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..37).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_actually_permutes() {
        let store = filled_store(20);
        let mut rng = StdRng::seed_from_u64(1);
        let provider = store.shuffled(&mut rng);
        let order: Vec<u32> = (0..20).map(|i| provider.features(i)[0] as u32).collect();
        assert_ne!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_next_batch_cycles() {
        let store = filled_store(3);
        let mut rng = StdRng::seed_from_u64(3);
        let mut provider = store.shuffled(&mut rng);
        let (inputs, targets) = provider.next_batch(5);
        assert_eq!(inputs.len(), 5 * 4);
        assert_eq!(targets.len(), 5);
        // 4件目は1件目と同じ
        assert_eq!(inputs[0], inputs[12]);
        assert_eq!(targets[0], targets[3]);
    }

    #[test]
    fn test_remove_bbox() {
        let mut store = filled_store(4);
        let bbox = key(2).bbox;
        store
            .append(TrainingKey::new(bbox, 99, 1), vec![2.0, 0.0, 0.0, 0.0], Label::Airplane)
            .unwrap();
        assert_eq!(store.remove_bbox(&bbox), 2);
        assert_eq!(store.len(), 3);
        assert_eq!(store.remove(&key(0)), 1);
        assert_eq!(store.label_counts(), (2, 0));
        store.clear();
        assert!(store.is_empty());
    }
}
