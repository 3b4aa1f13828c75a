// Resource loading: raw files and decoded textures

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

/// An open file handle. Closed on drop if not closed explicitly.
#[derive(Debug)]
pub struct ResourceFile {
    path: PathBuf,
    file: Option<File>,
}

impl ResourceFile {
    /// Open `path`. Read mode fails when the file is missing; write mode
    /// creates or truncates it. `binary` only affects logging.
    pub fn open(path: impl AsRef<Path>, mode: FileMode, binary: bool) -> Result<Self> {
        let path = path.as_ref();

        let mut options = OpenOptions::new();
        match mode {
            FileMode::Read => options.read(true),
            FileMode::Write => options.write(true).create(true).truncate(true),
        };

        let file = options
            .open(path)
            .with_context(|| format!("Failed to open {:?} ({:?})", path, mode))?;

        log::trace!("Opened {:?} ({:?}, binary: {})", path, mode, binary);
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    fn file(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file
            .as_mut()
            .with_context(|| format!("{:?} is already closed", path))
    }

    /// Size in bytes. The read position is left at the start of the file.
    pub fn size(&mut self) -> Result<u64> {
        let file = self.file()?;
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(size)
    }

    /// Fill `buffer` from the start of the file. Returns the number of bytes
    /// read, which is less than `buffer.len()` only at end of file.
    pub fn read_all_bytes(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;

        let mut filled = 0;
        while filled < buffer.len() {
            let read = file
                .read(&mut buffer[filled..])
                .with_context(|| format!("Failed to read {:?}", path))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    pub fn write_all_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone();
        self.file()?
            .write_all(bytes)
            .with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn close(&mut self) {
        if self.file.take().is_some() {
            log::trace!("Closed {:?}", self.path);
        }
    }
}

impl Drop for ResourceFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read a whole file.
pub fn read_resource(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let mut file = ResourceFile::open(path, FileMode::Read, true)?;
    let size = file.size()? as usize;
    let mut bytes = vec![0; size];
    let read = file.read_all_bytes(&mut bytes)?;
    bytes.truncate(read);
    Ok(bytes)
}

/// Decoded image, always expanded to RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TexturePixels {
    pub width: u32,
    pub height: u32,
    /// Channel count of the source image before expansion.
    pub channels: u8,
    pub rgba: Vec<u8>,
}

pub fn decode_texture(bytes: &[u8]) -> Result<TexturePixels> {
    let image = image::load_from_memory(bytes).context("Failed to decode image")?;
    let channels = image.color().channel_count();
    let rgba = image.to_rgba8();

    Ok(TexturePixels {
        width: rgba.width(),
        height: rgba.height(),
        channels,
        rgba: rgba.into_raw(),
    })
}

pub fn load_texture_pixels(path: impl AsRef<Path>) -> Result<TexturePixels> {
    let path = path.as_ref();
    let bytes = read_resource(path)?;
    let pixels = decode_texture(&bytes).with_context(|| format!("Failed to load texture {:?}", path))?;

    log::info!(
        "Loaded texture {:?}: {}x{}, {} channel(s)",
        path,
        pixels.width,
        pixels.height,
        pixels.channels
    );
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("quad-renderer-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_open_missing_file_fails() {
        let path = temp_path("does-not-exist.bin");
        assert!(ResourceFile::open(&path, FileMode::Read, true).is_err());
    }

    #[test]
    fn test_write_then_read_back() {
        let path = temp_path("roundtrip.bin");
        let mut file = ResourceFile::open(&path, FileMode::Write, true).unwrap();
        file.write_all_bytes(b"spirv-ish bytes").unwrap();
        file.close();
        assert!(file.write_all_bytes(b"late").is_err());

        let mut file = ResourceFile::open(&path, FileMode::Read, true).unwrap();
        assert_eq!(file.size().unwrap(), 15);

        let mut buffer = [0u8; 32];
        assert_eq!(file.read_all_bytes(&mut buffer).unwrap(), 15);
        assert_eq!(&buffer[..15], b"spirv-ish bytes");

        assert_eq!(read_resource(&path).unwrap(), b"spirv-ish bytes");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_closed_file_reports_error() {
        let path = temp_path("closed.bin");
        let mut file = ResourceFile::open(&path, FileMode::Write, true).unwrap();
        file.close();
        assert!(file.size().is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_decode_expands_to_rgba() {
        let source = image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, 9]));
        let mut png = Vec::new();
        source
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let pixels = decode_texture(&png).unwrap();

        assert_eq!((pixels.width, pixels.height, pixels.channels), (3, 2, 3));
        assert_eq!(pixels.rgba.len(), 3 * 2 * 4);
        assert_eq!(&pixels.rgba[4..8], &[1, 0, 9, 255]);
    }
}
