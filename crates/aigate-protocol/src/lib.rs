//! Anthropic-compatible message DTOs and stream event frames.
//!
//! This crate carries only the request/response shapes the pool runtime and
//! adapters need; full protocol translation lives outside the core.

pub mod message;
pub mod sse;
pub mod stream;

pub use message::{
    CacheControl, ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role,
    SystemPrompt, SystemTextBlock, ThinkingConfig, ToolDefinition, Usage,
};
pub use stream::{
    ContentBlockDelta, MessageDeltaBody, StartContentBlock, StopReason, StreamEvent, StreamMessage,
};
