// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message model, streaming providers, and cross-provider plumbing.
//!
//! This crate is the protocol layer of the runtime: typed conversation
//! messages, the event-stream primitive both providers and the agent speak
//! through, streaming clients for the two supported wire protocols
//! (`chat/completions` and Anthropic `messages`), the cross-provider message
//! transform, and tool-argument validation.

pub mod credentials;
pub mod descriptor;
pub mod mock;
pub mod provider;
pub mod stream;
pub mod transform;
pub mod validation;
mod anthropic;
mod openai_compat;
mod sse;
mod types;

pub use anthropic::{stream_messages, stream_simple_messages, MessagesOptions};
pub use descriptor::{compat_for, CompatOverride, CompletionsCompat, InputModality, Model};
pub use openai_compat::{stream_completions, stream_simple_completions, CompletionsOptions};
pub use provider::{
    complete_simple, stream_simple, AbortSignal, CacheRetention, ProviderEvent, ProviderSender,
    ProviderStream, SimpleStreamOptions, StreamFn, StreamOptions,
};
pub use stream::{event_stream, EventSender, EventStream, StreamError};
pub use transform::{
    normalize_anthropic_tool_id, normalize_mistral_tool_id, normalize_openai_tool_id,
    transform_messages, NormalizeToolCallId,
};
pub use types::*;
pub use validation::validate_tool_arguments;
