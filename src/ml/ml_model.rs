//! 機械学習モデルの共通定義
//!
//! 特徴ベクトルを採点する全結合ネットワークと、学習済み特徴抽出器として使うCNNを提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use image::RgbImage;
use tracing::debug;

use crate::error::MlMapError;

/// 分類器の設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 入力特徴ベクトル長
    pub input_size: usize,
    /// 隠れ層のユニット数
    pub hidden_sizes: [usize; 3],
}

impl ClassifierConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> TileClassifier<B> {
        let [h1, h2, h3] = self.hidden_sizes;
        debug!("分類器: {} -> {} -> {} -> {} -> 1", self.input_size, h1, h2, h3);

        TileClassifier {
            fc1: LinearConfig::new(self.input_size, h1).init(device),
            fc2: LinearConfig::new(h1, h2).init(device),
            fc3: LinearConfig::new(h2, h3).init(device),
            output: LinearConfig::new(h3, 1).init(device),
            activation: Relu::new(),
        }
    }
}

/// 特徴ベクトルを採点する全結合ネットワーク
///
/// # アーキテクチャ
/// - FC: input -> 64 + ReLU
/// - FC: 64 -> 32 + ReLU
/// - FC: 32 -> 16 + ReLU
/// - FC: 16 -> 1（活性化なし）
#[derive(Module, Debug)]
pub struct TileClassifier<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> TileClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `x`: 特徴ベクトル [batch_size, input_size]
    ///
    /// # 戻り値
    /// - スコア [batch_size, 1]
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.activation.forward(self.fc2.forward(x));
        let x = self.activation.forward(self.fc3.forward(x));
        self.output.forward(x)
    }

    /// 平坦化した特徴ベクトル群を採点する
    pub fn score(&self, rows: &[f32], input_size: usize, device: &B::Device) -> crate::error::Result<Vec<f32>> {
        if rows.is_empty() || input_size == 0 || rows.len() % input_size != 0 {
            return Err(MlMapError::FeatureLength {
                expected: input_size,
                actual: rows.len(),
            });
        }
        let batch_size = rows.len() / input_size;
        let x = Tensor::<B, 1>::from_floats(rows, device).reshape([batch_size, input_size]);
        tensor_to_vec(self.forward(x))
    }
}

/// テンソルの値を読み出す
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> crate::error::Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| MlMapError::Tensor(format!("{:?}", e)))
}

/// 特徴抽出器CNNの設定
#[derive(Config, Debug)]
pub struct ExtractorCnnConfig {
    /// 出力クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 227)]
    pub image_size: usize,
}

impl ExtractorCnnConfig {
    /// 畳み込み後の特徴マップの一辺
    ///
    /// Conv (3x3, no padding) でサイズが2減少し、Pool (2x2) で半分になる。
    pub fn feature_map_size(&self) -> usize {
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        let after_pool2 = after_conv2 / 2;
        after_pool2.saturating_sub(2)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<ExtractorCnn<B>> {
        let feature_map_size = self.feature_map_size();
        if feature_map_size == 0 {
            return Err(MlMapError::Config(format!(
                "入力サイズが小さすぎます: {} (最小18x18が必要)",
                self.image_size
            )));
        }
        if self.num_classes == 0 {
            return Err(MlMapError::Config("num_classes は1以上が必要です".to_string()));
        }

        debug!(
            "特徴抽出器: 入力 {}x{}, Conv3後 128 x {}x{}, 出力 {}クラス",
            self.image_size, self.image_size, feature_map_size, feature_map_size, self.num_classes
        );

        Ok(ExtractorCnn {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).with_stride([1, 1]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).with_stride([1, 1]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            conv3: Conv2dConfig::new([64, 128], [3, 3]).with_stride([1, 1]).init(device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(128, 64).init(device),
            fc2: LinearConfig::new(64, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 学習済み特徴抽出器として使うCNN
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 2
/// - Conv 3x3 (no padding) + ReLU
/// - Global Average Pooling -> 128
/// - FC: 128 -> 64 + ReLU
/// - FC: 64 -> num_classes
/// - Softmax (確率出力時)
#[derive(Module, Debug)]
pub struct ExtractorCnn<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    global_pool: AdaptiveAvgPool2d,

    fc1: Linear<B>,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> ExtractorCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.pool1.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool2.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.activation.forward(self.conv3.forward(x));

        let x = self.global_pool.forward(x);
        let [_, c, _, _] = x.dims();
        let x = x.reshape([batch_size, c]);

        let x = self.activation.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

/// RGB画像をImageNetの平均と標準偏差で正規化する
///
/// # 戻り値
/// - (C, H, W) の順で平坦化したデータ
pub fn normalize_image(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    let mean = [0.485, 0.456, 0.406];
    let std = [0.229, 0.224, 0.225];

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = img.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - mean[channel]) / std[channel]);
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::CpuBackend;
    use burn_ndarray::NdArrayDevice;

    #[test]
    fn test_classifier_output_shape() {
        let device = NdArrayDevice::Cpu;
        let model = ClassifierConfig::new(12, [4, 3, 2]).init::<CpuBackend>(&device);
        let scores = model.score(&vec![0.5; 36], 12, &device).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_classifier_rejects_ragged_rows() {
        let device = NdArrayDevice::Cpu;
        let model = ClassifierConfig::new(12, [4, 3, 2]).init::<CpuBackend>(&device);
        let result = model.score(&vec![0.5; 13], 12, &device);
        assert!(matches!(result, Err(MlMapError::FeatureLength { expected: 12, actual: 13 })));
    }

    #[test]
    fn test_extractor_probabilities_sum_to_one() {
        let device = NdArrayDevice::Cpu;
        let model = ExtractorCnnConfig::new(5)
            .with_image_size(20)
            .init::<CpuBackend>(&device)
            .unwrap();
        let images = Tensor::<CpuBackend, 4>::zeros([2, 3, 20, 20], &device);
        let probs = tensor_to_vec(model.probabilities(images)).unwrap();
        assert_eq!(probs.len(), 10);
        for row in probs.chunks(5) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_extractor_rejects_tiny_input() {
        let config = ExtractorCnnConfig::new(5).with_image_size(14);
        assert_eq!(config.feature_map_size(), 0);
        assert!(config.init::<CpuBackend>(&NdArrayDevice::Cpu).is_err());
    }

    #[test]
    fn test_normalize_image_layout() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 0]));
        let data = normalize_image(&img);
        assert_eq!(data.len(), 12);
        assert!((data[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((data[4] - (0.0 - 0.456) / 0.224).abs() < 1e-5);
    }

    #[test]
    fn test_configs_round_trip_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        ClassifierConfig::new(12, [4, 3, 2]).save(&path).unwrap();
        let loaded = ClassifierConfig::load(&path).unwrap();
        assert_eq!(loaded.input_size, 12);
        assert_eq!(loaded.hidden_sizes, [4, 3, 2]);

        let path = dir.path().join("extractor.json");
        ExtractorCnnConfig::new(7).save(&path).unwrap();
        let loaded = ExtractorCnnConfig::load(&path).unwrap();
        assert_eq!(loaded.num_classes, 7);
        assert_eq!(loaded.image_size, 227);
    }
}
