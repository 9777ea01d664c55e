//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（モデルの種類、層構成、学習データ件数など）
//! - model.bin       - モデルの重み（BinBytesRecorder形式）

use anyhow::{Context, Result};
use std::path::Path;
use std::fs::File;
use std::io::Read;
use tar::{Builder, Archive};
use flate2::Compression;
use flate2::write::GzEncoder;
use flate2::read::GzDecoder;
use tracing::debug;

use crate::model::model_metadata::{ModelKind, ModelMetadata};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    // output_pathがすでに.tar.gzで終わっている場合はそのまま、そうでなければ拡張子を追加
    let tar_gz_path = archive_path(output_path);
    
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }
    
    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())
        .context("Failed to add metadata.json to tar")?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)
        .context("Failed to add model.bin to tar")?;

    // tarアーカイブを完成させてからgzipを閉じる
    let encoder = tar_builder.into_inner()
        .context("Failed to finalize tar.gz archive")?;
    encoder.finish()
        .context("Failed to finish gzip stream")?;

    debug!("モデルを保存しました: {} ({} bytes)", tar_gz_path.display(), model_binary.len());
    Ok(())
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// 保存時に付く拡張子を反映したパス
pub fn archive_path(output_path: &Path) -> std::path::PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// アーカイブ内の指定ファイルを読み出す（見つからなければNone）
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(Some(buffer));
        }
    }
    Ok(None)
}

fn parse_metadata(bytes: &[u8]) -> Result<ModelMetadata> {
    let json = std::str::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(json)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, METADATA_ENTRY)?
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))?;
    parse_metadata(&bytes)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entry(tar_gz_path, MODEL_ENTRY)?
        .ok_or_else(|| anyhow::anyhow!("model.bin not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む（アーカイブは1回だけ走査する）
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata = None;
    let mut binary = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut buffer = Vec::new();
        match name.as_str() {
            METADATA_ENTRY => {
                entry.read_to_end(&mut buffer)?;
                metadata = Some(parse_metadata(&buffer)?);
            }
            MODEL_ENTRY => {
                entry.read_to_end(&mut buffer)?;
                binary = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata, binary) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("種類: {}", metadata.kind);
    match metadata.kind {
        ModelKind::Classifier => {
            println!("入力サイズ: {}", metadata.input_size);
            println!("隠れ層: {:?}", metadata.hidden_sizes);
            println!("特徴抽出: {}", metadata.extraction_mode);
            println!("ズーム: {}", metadata.zoom);
            println!("学習データ件数: {}", metadata.num_examples);
            println!("累計ステップ数: {}", metadata.steps);
        }
        ModelKind::Extractor => {
            println!("クラス数: {}", metadata.num_classes);
            println!("入力画像サイズ: {}x{}", metadata.canonical_size, metadata.canonical_size);
        }
    }
    println!("保存日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::ExtractionMode;

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("classifier");
        let metadata = ModelMetadata::classifier(12, &[4, 3, 2], ExtractionMode::Raw, 17, 2, 10);
        let binary = vec![1u8, 2, 3, 4, 5];

        save_model_with_metadata(&path, &metadata, &binary).unwrap();
        let saved = archive_path(&path);
        assert_eq!(saved, dir.path().join("models").join("classifier.tar.gz"));

        let (loaded, loaded_binary) = load_model_with_metadata(&saved).unwrap();
        assert_eq!(loaded.input_size, 12);
        assert_eq!(loaded_binary, binary);
        assert_eq!(load_metadata(&saved).unwrap().steps, 10);
        assert_eq!(load_model_binary(&saved).unwrap(), binary);
    }

    #[test]
    fn test_missing_archive_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_model_with_metadata(&dir.path().join("none.tar.gz")).is_err());
    }
}
