//! 串联源: 读取另一条管线的最新合成帧

use std::sync::Arc;
use std::time::Duration;

use super::{FrameSource, RawFrame, ReadOutcome};
use crate::error::Result;
use crate::pipeline::compositor::LastFrame;

const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct PipelineSource {
    upstream: String,
    cache: Arc<LastFrame>,
    last_version: u64,
}

impl PipelineSource {
    pub fn new(upstream: &str, cache: Arc<LastFrame>) -> Self {
        Self {
            upstream: upstream.to_string(),
            cache,
            last_version: 0,
        }
    }
}

impl FrameSource for PipelineSource {
    fn read(&mut self) -> Result<ReadOutcome> {
        match self.cache.wait_newer(self.last_version, WAIT_TIMEOUT) {
            Some((version, frame)) => {
                self.last_version = version;
                Ok(ReadOutcome::Frame(RawFrame {
                    data: frame.data,
                    meta: frame.meta.map(|m| (*m).clone()),
                }))
            }
            None => Ok(ReadOutcome::Idle),
        }
    }

    fn describe(&self) -> String {
        format!("pipeline:{}", self.upstream)
    }
}
