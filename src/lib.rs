// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod broadcast; // 多客户端 MJPEG 推流
pub mod config; // 管线配置
pub mod counting; // 方向计数
pub mod detection; // 检测接口与追踪
pub mod error; // 错误分类
pub mod events; // 事件回调
pub mod frame; // 帧
pub mod input; // 视频输入系统
pub mod pipeline; // 管线编排
pub mod registry; // 管线注册表
pub mod server; // HTTP 接口

pub use crate::config::{AppConfig, ConfigPatch, ModelSpec, PipelineConfig, SourceSpec};
pub use crate::error::{PipelineError, Result};
pub use crate::events::{EventKind, PipelineEvent};
pub use crate::frame::Frame;
pub use crate::pipeline::Pipeline;
pub use crate::registry::PipelineRegistry;
