//! 文件帧源: MJPEG 文件 / 单张图片 / 图片目录
//!
//! 容器格式 (mp4 / mkv ...) 交给 FFmpeg 解码 (需 ffmpeg 特性)。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{take_jpeg, FrameSource, Pacer, RawFrame, ReadOutcome};
use crate::error::{PipelineError, Result};
use crate::pipeline::compositor::encode_jpeg;

/// 未指定帧率时的默认播放速度
pub const DEFAULT_FILE_FPS: f64 = 25.0;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];
const MJPEG_EXTENSIONS: [&str; 2] = ["mjpg", "mjpeg"];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn is_image(path: &Path) -> bool {
    extension(path).map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// 按扩展名打开文件源
pub fn open(path: &Path, fps: Option<f64>) -> Result<Box<dyn FrameSource>> {
    if !path.exists() {
        return Err(PipelineError::SourceUnavailable(format!(
            "文件不存在: {}",
            path.display()
        )));
    }
    let fps = fps.or(Some(DEFAULT_FILE_FPS));

    if path.is_dir() {
        let mut images: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", path.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        images.sort();
        if images.is_empty() {
            return Err(PipelineError::SourceUnavailable(format!(
                "目录中没有图片: {}",
                path.display()
            )));
        }
        return Ok(Box::new(ImageSequence::new(path, images, fps)));
    }

    match extension(path).as_deref() {
        Some(ext) if MJPEG_EXTENSIONS.contains(&ext) => Ok(Box::new(MjpegFile::open(path, fps)?)),
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Ok(Box::new(ImageSequence::new(
            path,
            vec![path.to_path_buf()],
            fps,
        ))),
        #[cfg(feature = "ffmpeg")]
        _ => Ok(Box::new(super::ffmpeg::FfmpegSource::file(path, fps)?)),
        #[cfg(not(feature = "ffmpeg"))]
        _ => Err(PipelineError::SourceUnavailable(format!(
            "{} 需要启用 ffmpeg 特性解码",
            path.display()
        ))),
    }
}

/// 拼接 JPEG 文件 (.mjpg)
pub struct MjpegFile {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    buf: Vec<u8>,
    chunk: Vec<u8>,
    pacer: Pacer,
}

impl MjpegFile {
    pub fn open(path: &Path, fps: Option<f64>) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PipelineError::SourceUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(BufReader::new(file)),
            buf: Vec::new(),
            chunk: vec![0; 64 * 1024],
            pacer: Pacer::new(fps),
        })
    }

    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(jpeg) = take_jpeg(&mut self.buf) {
                return Ok(Some(jpeg));
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            let n = reader
                .read(&mut self.chunk)
                .map_err(|e| PipelineError::TransientRead(format!("{}: {}", self.path.display(), e)))?;
            if n == 0 {
                debug!("📄 文件读取完毕: {}", self.path.display());
                self.reader = None;
                return Ok(None);
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }
}

impl FrameSource for MjpegFile {
    fn read(&mut self) -> Result<ReadOutcome> {
        match self.next_jpeg()? {
            Some(jpeg) => {
                self.pacer.wait();
                Ok(ReadOutcome::Frame(RawFrame::new(jpeg)))
            }
            None => Ok(ReadOutcome::Exhausted),
        }
    }

    fn release(&mut self) {
        self.reader = None;
        self.buf.clear();
    }

    fn describe(&self) -> String {
        format!("mjpeg:{}", self.path.display())
    }
}

/// 图片序列 (单张图片 / 目录)
pub struct ImageSequence {
    root: PathBuf,
    pending: VecDeque<PathBuf>,
    pacer: Pacer,
}

impl ImageSequence {
    pub fn new(root: &Path, images: Vec<PathBuf>, fps: Option<f64>) -> Self {
        Self {
            root: root.to_path_buf(),
            pending: images.into(),
            pacer: Pacer::new(fps),
        }
    }

    fn load(path: &Path) -> Result<Vec<u8>> {
        let bytes = std::fs::read(path)
            .map_err(|e| PipelineError::TransientRead(format!("{}: {}", path.display(), e)))?;
        if matches!(extension(path).as_deref(), Some("jpg") | Some("jpeg")) {
            return Ok(bytes);
        }
        // 其它格式统一转成 JPEG
        let img = image::load_from_memory(&bytes)
            .map_err(|e| PipelineError::TransientRead(format!("{}: {}", path.display(), e)))?;
        encode_jpeg(&img.to_rgb8(), 90)
    }
}

impl FrameSource for ImageSequence {
    fn read(&mut self) -> Result<ReadOutcome> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(ReadOutcome::Exhausted);
        };
        let data = Self::load(&path)?;
        self.pacer.wait();
        Ok(ReadOutcome::Frame(RawFrame::new(data)))
    }

    fn release(&mut self) {
        self.pending.clear();
    }

    fn describe(&self) -> String {
        format!("images:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::solid_jpeg;
    use std::io::Write;

    fn read_all(source: &mut dyn FrameSource) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        loop {
            match source.read().unwrap() {
                ReadOutcome::Frame(f) => frames.push(f),
                ReadOutcome::Idle => continue,
                ReadOutcome::Exhausted => break,
            }
        }
        frames
    }

    #[test]
    fn test_mjpeg_file_yields_each_image_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mjpg");
        let mut file = File::create(&path).unwrap();
        for v in [10u8, 120, 240] {
            file.write_all(&solid_jpeg(32, 24, v)).unwrap();
        }
        drop(file);

        let mut source = open(&path, Some(1000.0)).unwrap();
        let frames = read_all(source.as_mut());
        assert_eq!(frames.len(), 3);
        for f in &frames {
            assert!(image::load_from_memory(&f.data).is_ok());
        }
        assert!(matches!(source.read().unwrap(), ReadOutcome::Exhausted));
    }

    #[test]
    fn test_image_directory_is_sorted_and_converted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), solid_jpeg(16, 16, 200)).unwrap();
        image::RgbImage::new(16, 16)
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let mut source = open(dir.path(), Some(1000.0)).unwrap();
        let frames = read_all(source.as_mut());
        assert_eq!(frames.len(), 2);
        // png 被转成 JPEG
        assert_eq!(&frames[0].data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        assert!(matches!(
            open(Path::new("/nonexistent/clip.mjpg"), None),
            Err(PipelineError::SourceUnavailable(_))
        ));
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_container_needs_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not really").unwrap();
        assert!(matches!(
            open(&path, None),
            Err(PipelineError::SourceUnavailable(_))
        ));
    }
}
