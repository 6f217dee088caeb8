//! Локальное хранилище синтезированных клипов
//!
//! Клип хранится по ключу `(unit_id, voice_id)`: `{root}/{unit}/{voice}.{ext}`.
//! При превышении лимита размера удаляются самые старые файлы.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::Result;
use crate::tts::provider::AudioClip;

/// Сохранённый клип
#[derive(Debug, Clone, PartialEq)]
pub struct StoredClip {
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

pub struct ClipStore {
    root: PathBuf,
    max_size: Option<u64>,
}

/// Оставить в компоненте пути только безопасные символы
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl ClipStore {
    pub fn new(root: impl Into<PathBuf>, max_size: Option<u64>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, max_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_dir(&self, unit_id: &str) -> PathBuf {
        self.root.join(sanitize(unit_id))
    }

    /// Путь клипа для ключа
    pub fn path_for(&self, unit_id: &str, voice_id: &str, extension: &str) -> PathBuf {
        self.unit_dir(unit_id)
            .join(format!("{}.{}", sanitize(voice_id), extension))
    }

    /// Найти сохранённый клип по ключу
    pub fn get(&self, unit_id: &str, voice_id: &str) -> Option<PathBuf> {
        let dir = self.unit_dir(unit_id);
        let stem = sanitize(voice_id);
        fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_file() && p.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()))
    }

    /// Сохранить клип, заменив предыдущий для того же ключа
    pub fn put(&self, unit_id: &str, voice_id: &str, clip: &AudioClip) -> Result<StoredClip> {
        if let Some(previous) = self.get(unit_id, voice_id) {
            fs::remove_file(previous)?;
        }
        let path = self.path_for(unit_id, voice_id, &clip.extension);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &clip.bytes)?;

        let stored = StoredClip {
            path: path.clone(),
            checksum: clip.checksum.clone(),
            size: clip.bytes.len() as u64,
        };
        self.enforce_limit(&path)?;
        Ok(stored)
    }

    pub fn remove(&self, unit_id: &str, voice_id: &str) -> Result<bool> {
        match self.get(unit_id, voice_id) {
            Some(path) => {
                fs::remove_file(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Проверить целостность файла по MD5
    pub fn verify(&self, path: &Path, checksum: &str) -> Result<bool> {
        let bytes = fs::read(path)?;
        Ok(format!("{:x}", md5::compute(&bytes)) == checksum)
    }

    fn files(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let metadata = e.metadata().ok()?;
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((e.into_path(), metadata.len(), modified))
            })
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|(_, size, _)| size).sum()
    }

    /// Удалять самые старые файлы, пока размер не уложится в лимит.
    /// Только что записанный файл не удаляется.
    fn enforce_limit(&self, keep: &Path) -> Result<()> {
        let Some(max_size) = self.max_size else {
            return Ok(());
        };
        let mut files = self.files();
        let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total <= max_size {
            return Ok(());
        }

        files.sort_by(|a, b| a.2.cmp(&b.2));
        for (path, size, _) in files {
            if total <= max_size {
                break;
            }
            if path == keep {
                continue;
            }
            fs::remove_file(&path)?;
            log::debug!("Evicted {} ({} bytes)", path.display(), size);
            total -= size;
        }
        Ok(())
    }
}
