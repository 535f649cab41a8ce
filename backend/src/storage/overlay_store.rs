use image::{ImageFormat, RgbImage};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

const OVERLAY_PREFIX: &str = "overlay_";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encoding error: {0}")]
    Encode(#[from] image::ImageError),
    #[error("File too large")]
    FileTooLarge,
}

/// Upload scratch files and generated overlays, both kept in one directory.
#[derive(Clone)]
pub struct OverlayStore {
    root: PathBuf,
}

impl OverlayStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an upload's file extension to the format its overlay is saved in.
    pub fn output_format(extension: Option<&str>) -> (ImageFormat, &'static str) {
        match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
            Some("jpg") | Some("jpeg") => (ImageFormat::Jpeg, "jpg"),
            Some("bmp") => (ImageFormat::Bmp, "bmp"),
            _ => (ImageFormat::Png, "png"),
        }
    }

    /// Extension of a client-supplied filename, if it is short and alphanumeric.
    pub fn upload_extension(filename: &str) -> Option<String> {
        let extension = Path::new(filename).extension()?.to_str()?;
        if extension.is_empty()
            || extension.len() > 5
            || !extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return None;
        }
        Some(extension.to_ascii_lowercase())
    }

    pub fn generate_filename(extension: &str) -> String {
        format!("{}{}.{}", OVERLAY_PREFIX, Uuid::new_v4(), extension)
    }

    /// Only names produced by `generate_filename` resolve.
    pub fn path_for(&self, filename: &str) -> Option<PathBuf> {
        let rest = filename.strip_prefix(OVERLAY_PREFIX)?;
        let (id, extension) = rest.split_once('.')?;
        Uuid::parse_str(id).ok()?;
        if !matches!(extension, "png" | "jpg" | "bmp") {
            return None;
        }
        Some(self.root.join(filename))
    }

    pub fn save(&self, image: &RgbImage, upload_extension: Option<&str>) -> Result<String, StorageError> {
        let (format, extension) = Self::output_format(upload_extension);
        let filename = Self::generate_filename(extension);
        let path = self.root.join(&filename);
        image.save_with_format(&path, format)?;
        log::info!("Saved overlay {}", path.display());
        Ok(filename)
    }

    /// Scratch file for an incoming upload, removed when the returned guard drops.
    pub fn scratch_file(&self, extension: Option<&str>) -> Result<ScratchUpload, StorageError> {
        let suffix = extension.map(|e| format!(".{}", e)).unwrap_or_default();
        let file = tempfile::Builder::new()
            .prefix("upload_")
            .suffix(&suffix)
            .tempfile_in(&self.root)?;
        Ok(ScratchUpload {
            file,
            written: 0,
            extension: extension.map(str::to_string),
        })
    }
}

pub struct ScratchUpload {
    file: NamedTempFile,
    written: usize,
    extension: Option<String>,
}

impl ScratchUpload {
    pub fn append(&mut self, chunk: &[u8], limit: usize) -> Result<(), StorageError> {
        if self.written + chunk.len() > limit {
            return Err(StorageError::FileTooLarge);
        }
        self.file.write_all(chunk)?;
        self.written += chunk.len();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        Ok(())
    }
}
