// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Expansion of stored API-key values (§4.7): a leading `!` runs the rest
//! of the string as a shell command and takes its trimmed stdout; anything
//! else is expanded for `$VAR` / `${VAR}` references against the process
//! environment.

use std::process::Command;

pub fn expand(raw: &str) -> anyhow::Result<String> {
    if let Some(cmd) = raw.strip_prefix('!') {
        run_cmd(cmd)
    } else {
        Ok(shellexpand::env(raw)?.into_owned())
    }
}

fn run_cmd(cmd: &str) -> anyhow::Result<String> {
    let output = Command::new("sh").arg("-c").arg(cmd).output()?;
    if !output.status.success() {
        anyhow::bail!(
            "credential command `{cmd}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
