// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Invocation of the external firmware tools (`cbootimage`, `gbb_utility`,
//! `cbfstool`, the device tree compiler, ...).

use std::{
    ffi::OsString,
    io,
    path::Path,
    process::{Command, ExitStatus, Stdio},
    string::FromUtf8Error,
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::util::DebugString;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}: {2}")]
    CommandExecution(DebugString, ExitStatus, String),
    #[error("Command output is not UTF-8: {0:?}")]
    OutputNotUtf8(DebugString, #[source] FromUtf8Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Runs external tools to completion.
pub trait ToolRunner {
    /// Run `tool` with `args`, optionally from within `cwd`, and return its
    /// standard output. A non-zero exit status is an error.
    fn run(&self, tool: &str, args: &[OsString], cwd: Option<&Path>) -> Result<String>;
}

impl<R: ToolRunner + ?Sized> ToolRunner for &R {
    fn run(&self, tool: &str, args: &[OsString], cwd: Option<&Path>) -> Result<String> {
        (**self).run(tool, args, cwd)
    }
}

/// Runs tools as child processes found via `PATH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, tool: &str, args: &[OsString], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new(tool);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        debug!("Running: {command:?}");

        let output = command
            .output()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        if !output.status.success() {
            return Err(Error::CommandExecution(
                DebugString::new(&command),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            ));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| Error::OutputNotUtf8(DebugString::new(&command), e))?;
        trace!("Output of {tool}: {stdout:?}");

        Ok(stdout)
    }
}
