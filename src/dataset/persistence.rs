//! 学習データの永続化
//!
//! キー `{bbox, x, y}` ごとにラベルと（任意で）特徴ベクトルを保存します。
//! ファイル保存ではスキーマバージョンと作業ズームを先頭に記録し、
//! 異なるズームで作られたデータを読み込まないようにします。
//!
//! ファイル構成（JSON）:
//! - schema_version: 保存形式のバージョン
//! - zoom: 作業ズームレベル
//! - examples: `TrainingKey` のJSON文字列 → `PersistedExample`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MlMapError, Result};
use crate::types::{GeoBBox, Label, TrainingKey};

/// 保存形式のバージョン
pub const SCHEMA_VERSION: u32 = 1;

/// 保存される1件分の値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedExample {
    pub label: Label,
    /// 保存しない設定の場合はNone（再読み込み時にタイルから再抽出する）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<f32>>,
}

/// 学習データの保存先
pub trait TrainingPersistence: Send {
    /// 追加または上書き
    fn put(&mut self, key: &TrainingKey, value: PersistedExample) -> Result<()>;

    /// 削除（存在した場合true）
    fn delete(&mut self, key: &TrainingKey) -> Result<bool>;

    /// すべての保存データ
    fn get_all(&self) -> Result<Vec<(TrainingKey, PersistedExample)>>;

    /// すべて削除
    fn clear(&mut self) -> Result<()>;

    /// 指定矩形から作られたデータをすべて削除し、削除件数を返す
    fn delete_bbox(&mut self, bbox: &GeoBBox) -> Result<usize> {
        let keys: Vec<TrainingKey> = self
            .get_all()?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| &key.bbox == bbox)
            .collect();
        let mut removed = 0;
        for key in &keys {
            if self.delete(key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn decode_key(raw: &str) -> Result<TrainingKey> {
    serde_json::from_str(raw)
        .map_err(|e| MlMapError::Persistence(format!("不正なキーです ({}): {}", raw, e)))
}

fn collect_entries(entries: &BTreeMap<String, PersistedExample>) -> Result<Vec<(TrainingKey, PersistedExample)>> {
    entries
        .iter()
        .map(|(raw, value)| Ok((decode_key(raw)?, value.clone())))
        .collect()
}

/// メモリ上の保存先（テスト・一時セッション用）
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, PersistedExample>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TrainingPersistence for MemoryStore {
    fn put(&mut self, key: &TrainingKey, value: PersistedExample) -> Result<()> {
        self.entries.insert(key.storage_key(), value);
        Ok(())
    }

    fn delete(&mut self, key: &TrainingKey) -> Result<bool> {
        Ok(self.entries.remove(&key.storage_key()).is_some())
    }

    fn get_all(&self) -> Result<Vec<(TrainingKey, PersistedExample)>> {
        collect_entries(&self.entries)
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    schema_version: u32,
    zoom: u32,
    #[serde(default)]
    examples: BTreeMap<String, PersistedExample>,
}

/// JSONファイルへの保存先（変更のたびに書き出す）
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    zoom: u32,
    entries: BTreeMap<String, PersistedExample>,
}

impl JsonFileStore {
    /// ファイルを開く（存在しなければ空の保存先を作る）
    ///
    /// スキーマバージョンかズームが異なる場合は `SchemaMismatch` を返す。
    pub fn open<P: AsRef<Path>>(path: P, zoom: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            debug!("学習データファイルがないため新規作成します: {}", path.display());
            return Ok(Self {
                path,
                zoom,
                entries: BTreeMap::new(),
            });
        }

        let contents = fs::read_to_string(&path)?;
        let file: StoreFile = serde_json::from_str(&contents)?;
        if file.schema_version != SCHEMA_VERSION || file.zoom != zoom {
            return Err(MlMapError::SchemaMismatch {
                found: format!("v{} zoom {}", file.schema_version, file.zoom),
                expected: format!("v{} zoom {}", SCHEMA_VERSION, zoom),
            });
        }

        info!("学習データを読み込みました: {} ({}件)", path.display(), file.examples.len());
        Ok(Self {
            path,
            zoom,
            entries: file.examples,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn zoom(&self) -> u32 {
        self.zoom
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 一時ファイルに書いてから置き換える
    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = StoreFile {
            schema_version: SCHEMA_VERSION,
            zoom: self.zoom,
            examples: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TrainingPersistence for JsonFileStore {
    fn put(&mut self, key: &TrainingKey, value: PersistedExample) -> Result<()> {
        self.entries.insert(key.storage_key(), value);
        self.flush()
    }

    fn delete(&mut self, key: &TrainingKey) -> Result<bool> {
        let removed = self.entries.remove(&key.storage_key()).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    fn get_all(&self) -> Result<Vec<(TrainingKey, PersistedExample)>> {
        collect_entries(&self.entries)
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(x: u32, y: u32) -> TrainingKey {
        TrainingKey::new(GeoBBox::new(-122.39, 37.61, -122.38, 37.62), x, y)
    }

    fn example(label: Label) -> PersistedExample {
        PersistedExample {
            label,
            features: Some(vec![0.5, 0.25]),
        }
    }

    #[test]
    fn test_memory_store_put_delete() {
        let mut store = MemoryStore::new();
        store.put(&key(1, 2), example(Label::Airplane)).unwrap();
        store.put(&key(1, 2), example(Label::NotAirplane)).unwrap();
        assert_eq!(store.len(), 1);

        let all = store.get_all().unwrap();
        assert_eq!(all[0].0, key(1, 2));
        assert_eq!(all[0].1.label, Label::NotAirplane);

        assert!(store.delete(&key(1, 2)).unwrap());
        assert!(!store.delete(&key(1, 2)).unwrap());
    }

    #[test]
    fn test_delete_bbox_only_matching() {
        let mut store = MemoryStore::new();
        store.put(&key(1, 2), example(Label::Airplane)).unwrap();
        store.put(&key(2, 2), example(Label::Airplane)).unwrap();
        let other = TrainingKey::new(GeoBBox::new(0.0, 0.0, 0.1, 0.1), 1, 2);
        store.put(&other, example(Label::NotAirplane)).unwrap();

        assert_eq!(store.delete_bbox(&key(0, 0).bbox).unwrap(), 2);
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, other);
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("training_data.json");

        let mut store = JsonFileStore::open(&path, 17).unwrap();
        store.put(&key(1, 2), example(Label::Airplane)).unwrap();
        store
            .put(&key(3, 4), PersistedExample { label: Label::NotAirplane, features: None })
            .unwrap();

        let reopened = JsonFileStore::open(&path, 17).unwrap();
        let all = reopened.get_all().unwrap();
        assert_eq!(all.len(), 2);
        let label_only = all.iter().find(|(k, _)| *k == key(3, 4)).unwrap();
        assert!(label_only.1.features.is_none());
        let full = all.iter().find(|(k, _)| *k == key(1, 2)).unwrap();
        assert_eq!(full.1.features.as_deref(), Some(&[0.5f32, 0.25][..]));
    }

    #[test]
    fn test_json_store_rejects_other_zoom() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("training_data.json");

        let mut store = JsonFileStore::open(&path, 17).unwrap();
        store.put(&key(1, 2), example(Label::Airplane)).unwrap();

        let result = JsonFileStore::open(&path, 18);
        assert!(matches!(result, Err(MlMapError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_json_store_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("training_data.json");

        let mut store = JsonFileStore::open(&path, 17).unwrap();
        store.put(&key(1, 2), example(Label::Airplane)).unwrap();
        store.clear().unwrap();

        let reopened = JsonFileStore::open(&path, 17).unwrap();
        assert!(reopened.is_empty());
    }
}
