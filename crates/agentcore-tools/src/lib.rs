// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod registry;
pub mod tool;

pub use registry::{ToolBatchOutcome, ToolRegistry, ToolSchema};
pub use tool::{
    OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart, ToolSuccess, ToolUpdate,
};
