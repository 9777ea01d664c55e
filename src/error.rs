//! エラー型の定義
//!
//! タイル取得・抽出・学習の各段階で呼び出し側が区別できるようにthiserrorで定義します。
//! アーカイブ入出力やバイナリ側はanyhowを使います。

use crate::types::TileCoord;

/// mlmap操作の結果型
pub type Result<T> = std::result::Result<T, MlMapError>;

/// mlmapのエラー
#[derive(Debug, thiserror::Error)]
pub enum MlMapError {
    /// タイル取得失敗（ログに出してそのタイルは学習データなしとして扱う）
    #[error("タイル取得に失敗しました ({coord}): {message}")]
    TileFetch { coord: TileCoord, message: String },

    /// 特徴抽出器の読み込みが完了していない
    #[error("特徴抽出器の準備ができていません")]
    ExtractorNotReady,

    /// 特徴抽出器の読み込み失敗
    #[error("特徴抽出器の読み込みに失敗しました: {0}")]
    ExtractorLoad(String),

    /// 損失がNaN/無限大になった（現在の学習は中断）
    #[error("ステップ {step} で損失が有限値ではありません: {loss}")]
    NonFiniteLoss { step: usize, loss: f64 },

    /// 学習データが空
    #[error("学習データがありません")]
    EmptyTrainingSet,

    /// 特徴ベクトル長の不一致
    #[error("特徴ベクトル長が不正です: {actual} (期待: {expected})")]
    FeatureLength { expected: usize, actual: usize },

    /// 永続化ファイルのスキーマ・ズームが異なる
    #[error("保存データのスキーマが一致しません: {found} (期待: {expected})")]
    SchemaMismatch { found: String, expected: String },

    /// 永続化層のエラー
    #[error("永続化エラー: {0}")]
    Persistence(String),

    /// 設定値のエラー
    #[error("設定エラー: {0}")]
    Config(String),

    /// テンソル演算・読み出しのエラー
    #[error("テンソルエラー: {0}")]
    Tensor(String),

    /// 非同期タスクのエラー
    #[error("タスクエラー: {0}")]
    Task(String),

    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("画像エラー: {0}")]
    Image(#[from] image::ImageError),
}
