//! 上游 HTTP 视频流 (multipart/x-mixed-replace)
//!
//! 上游直接返回单张图片时, 每次读取重新请求一次 (快照模式)。

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{FrameSource, Pacer, RawFrame, ReadOutcome};
use crate::error::{PipelineError, Result};

/// 未配置超时时的连接 / 读取超时
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// 快照模式的轮询频率
const SNAPSHOT_FPS: f64 = 10.0;

/// 单个分段的最大字节数
const MAX_PART_BYTES: usize = 32 * 1024 * 1024;

static CONTENT_LENGTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^content-length:\s*(\d+)").unwrap());
static BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)boundary="?([^";]+)"?"#).unwrap());

type BodyReader = BufReader<Box<dyn Read + Send + Sync + 'static>>;

enum Mode {
    Multipart { boundary: String },
    Snapshot,
}

pub struct StreamSource {
    url: String,
    agent: ureq::Agent,
    mode: Mode,
    reader: Option<BodyReader>,
    /// 快照模式下连接时已经取到的第一张
    pending: Option<Vec<u8>>,
    pacer: Pacer,
}

impl StreamSource {
    /// 连接上游; 首次连接失败返回 `SourceUnavailable`
    pub fn connect(url: &str, timeout: Option<Duration>) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();

        let response = agent
            .get(url)
            .call()
            .map_err(|e| PipelineError::SourceUnavailable(format!("{}: {}", url, e)))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_string();

        let mut source = Self {
            url: url.to_string(),
            agent,
            mode: Mode::Snapshot,
            reader: None,
            pending: None,
            pacer: Pacer::new(None),
        };

        let lower = content_type.to_ascii_lowercase();
        if lower.starts_with("multipart/") {
            let boundary = BOUNDARY
                .captures(&content_type)
                .map(|c| c[1].trim().trim_start_matches("--").to_string())
                .ok_or_else(|| {
                    PipelineError::SourceUnavailable(format!(
                        "{}: 缺少 boundary ({})",
                        url, content_type
                    ))
                })?;
            info!("📡 已连接上游流 {} (boundary={})", url, boundary);
            source.mode = Mode::Multipart { boundary };
            source.reader = Some(BufReader::new(response.into_reader()));
        } else if lower.starts_with("image/") {
            info!("📡 上游为单帧图片, 进入快照模式: {}", url);
            source.pending = Some(read_body(response).map_err(|e| {
                PipelineError::SourceUnavailable(format!("{}: {}", url, e))
            })?);
            source.pacer = Pacer::new(Some(SNAPSHOT_FPS));
        } else {
            return Err(PipelineError::SourceUnavailable(format!(
                "{}: 不支持的内容类型 {:?}",
                url, content_type
            )));
        }
        Ok(source)
    }

    fn transient(&self, message: impl std::fmt::Display) -> PipelineError {
        PipelineError::TransientRead(format!("{}: {}", self.url, message))
    }

    fn request(&self) -> Result<ureq::Response> {
        self.agent.get(&self.url).call().map_err(|e| self.transient(e))
    }

    fn read_snapshot(&mut self) -> Result<ReadOutcome> {
        let data = match self.pending.take() {
            Some(data) => data,
            None => {
                self.pacer.wait();
                let response = self.request()?;
                read_body(response).map_err(|e| self.transient(e))?
            }
        };
        Ok(ReadOutcome::Frame(RawFrame::new(data)))
    }

    fn read_part(&mut self, boundary: &str) -> Result<ReadOutcome> {
        if self.reader.is_none() {
            debug!("🔄 重新连接上游流: {}", self.url);
            let response = self.request()?;
            self.reader = Some(BufReader::new(response.into_reader()));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(ReadOutcome::Idle);
        };
        match next_part(reader, boundary) {
            Ok(frame) => Ok(ReadOutcome::Frame(frame)),
            Err(e) => {
                // 连接作废, 下次读取时重连
                self.reader = None;
                warn!("⚠️ 上游流读取失败 {}: {}", self.url, e);
                Err(self.transient(e))
            }
        }
    }
}

impl FrameSource for StreamSource {
    fn read(&mut self) -> Result<ReadOutcome> {
        match &self.mode {
            Mode::Snapshot => self.read_snapshot(),
            Mode::Multipart { boundary } => {
                let boundary = boundary.clone();
                self.read_part(&boundary)
            }
        }
    }

    fn release(&mut self) {
        self.reader = None;
        self.pending = None;
    }

    fn describe(&self) -> String {
        match self.mode {
            Mode::Multipart { .. } => format!("stream:{}", self.url),
            Mode::Snapshot => format!("snapshot:{}", self.url),
        }
    }
}

fn read_body(response: ureq::Response) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    response
        .into_reader()
        .take(MAX_PART_BYTES as u64)
        .read_to_end(&mut data)?;
    Ok(data)
}

fn eof() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "上游流已结束")
}

/// 读取下一个分段: 跳到 boundary, 解析头部, 按 Content-Length 或 EOI 取正文
fn next_part<R: BufRead>(reader: &mut R, boundary: &str) -> std::io::Result<RawFrame> {
    let marker = format!("--{}", boundary);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(eof());
        }
        if String::from_utf8_lossy(&line).trim().starts_with(&marker) {
            break;
        }
    }

    let mut length = None;
    let mut meta = BTreeMap::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(eof());
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            break;
        }
        if let Some(caps) = CONTENT_LENGTH.captures(text) {
            length = caps[1].parse::<usize>().ok();
        } else if let Some((key, value)) = text.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            if key != "content-type" {
                meta.insert(key, value.trim().to_string());
            }
        }
    }

    let data = match length {
        Some(n) if n <= MAX_PART_BYTES => {
            let mut body = vec![0; n];
            reader.read_exact(&mut body)?;
            body
        }
        Some(n) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("分段过大: {} 字节", n),
            ))
        }
        None => read_until_eoi(reader)?,
    };

    let mut frame = RawFrame::new(data);
    if !meta.is_empty() {
        frame.meta = Some(meta);
    }
    Ok(frame)
}

fn read_until_eoi<R: BufRead>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        if reader.read_until(0xD9, &mut body)? == 0 {
            return Err(eof());
        }
        if body.ends_with(&[0xFF, 0xD9]) {
            break;
        }
        if body.len() > MAX_PART_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "分段缺少 JPEG 结束标记",
            ));
        }
    }
    // 去掉正文前的空行
    let start = body
        .windows(2)
        .position(|w| w == [0xFF, 0xD8])
        .unwrap_or(0);
    body.drain(..start);
    Ok(body)
}
