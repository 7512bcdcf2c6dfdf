// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Facade crate re-exporting the full public surface of the component
//! crates under a single namespace. There is no CLI or TUI here; embedders
//! depend on this crate and reach every module through it.

pub mod config {
    pub use agentcore_config::*;
}

pub mod model {
    pub use agentcore_model::*;
}

pub mod tools {
    pub use agentcore_tools::*;
}

pub mod core {
    pub use agentcore_core::*;
}

pub mod session {
    pub use agentcore_session::*;
}

pub mod credentials {
    pub use agentcore_credentials::*;
}
