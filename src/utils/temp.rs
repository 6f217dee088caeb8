//! Модуль для работы с временными файлами
//!
//! Каждый прогон получает собственный рабочий каталог; промежуточные клипы
//! создаются внутри него и удаляются вместе с ним.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::Result;

/// Менеджер временных файлов одного прогона
pub struct TempFileManager {
    /// Временная директория
    temp_dir: Option<TempDir>,
    /// Путь к директории (сохраняется, даже если удаление отключено)
    path: PathBuf,
    /// Список выданных путей
    files: Vec<PathBuf>,
    /// Нужно ли удалять файлы при завершении
    cleanup: bool,
}

impl TempFileManager {
    /// Создать рабочий каталог внутри `parent`
    pub fn new_in<P: AsRef<Path>>(parent: P, prefix: &str, cleanup: bool) -> Result<Self> {
        fs::create_dir_all(parent.as_ref())?;
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", prefix))
            .tempdir_in(parent.as_ref())?;
        let path = temp_dir.path().to_path_buf();

        Ok(Self {
            temp_dir: Some(temp_dir),
            path,
            files: Vec::new(),
            cleanup,
        })
    }

    /// Получить путь для нового временного файла (файл не создаётся)
    pub fn path_for(&mut self, prefix: &str, extension: &str) -> PathBuf {
        let file_name = format!("{}_{}.{}", prefix, uuid::Uuid::new_v4().simple(), extension);
        let file_path = self.path.join(file_name);
        self.files.push(file_path.clone());
        file_path
    }

    /// Получить путь к временной директории
    pub fn dir(&self) -> &Path {
        &self.path
    }

    /// Количество выданных путей
    pub fn issued(&self) -> usize {
        self.files.len()
    }

    /// Удалить выданные файлы
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleanup {
            for file in &self.files {
                if file.exists() {
                    fs::remove_file(file)?;
                }
            }
            self.files.clear();
        }
        Ok(())
    }
}

impl Drop for TempFileManager {
    fn drop(&mut self) {
        let _ = self.cleanup();
        if let Some(dir) = self.temp_dir.take() {
            if self.cleanup {
                let _ = dir.close();
            } else {
                let kept = dir.into_path();
                log::debug!("Keeping work dir {}", kept.display());
            }
        }
    }
}
