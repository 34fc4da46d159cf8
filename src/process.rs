//! Helper process execution.
//!
//! The daemons shell out for a handful of jobs (PulseAudio suspend, input
//! synthesis, syndaemon). Every call goes through [`CommandRunner`] so the
//! callers can be exercised without spawning anything.

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::{DaemonError, Result};

#[async_trait]
pub trait CommandRunner: Send + Sync {
   /// Runs `program` to completion and returns its combined stdout and
   /// stderr. A non-zero exit status is an error carrying that output.
   async fn run(&self, program: &str, args: &[&str]) -> Result<String>;

   /// Runs `cmd` through `/bin/sh -c`.
   async fn run_shell(&self, cmd: &str) -> Result<String> {
      self.run("/bin/sh", &["-c", cmd]).await
   }
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

#[async_trait]
impl CommandRunner for TokioRunner {
   async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
      debug!("exec: {program} {}", args.join(" "));
      let output = Command::new(program)
         .args(args)
         .kill_on_drop(true)
         .output()
         .await?;

      let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
      text.push_str(&String::from_utf8_lossy(&output.stderr));

      if output.status.success() {
         Ok(text)
      } else {
         Err(DaemonError::CommandFailed(format!(
            "{program} exited with {}: {}",
            output.status,
            text.trim()
         )))
      }
   }
}

#[cfg(test)]
pub mod testing {
   use parking_lot::Mutex;

   use super::*;

   /// Runner that records command lines and never spawns anything.
   #[derive(Default)]
   pub struct RecordingRunner {
      calls: Mutex<Vec<String>>,
      fail_on: Mutex<Option<String>>,
   }

   impl RecordingRunner {
      pub fn new() -> std::sync::Arc<Self> {
         std::sync::Arc::new(Self::default())
      }

      /// Makes every command line containing `needle` fail.
      pub fn fail_on(&self, needle: &str) {
         *self.fail_on.lock() = Some(needle.to_string());
      }

      pub fn calls(&self) -> Vec<String> {
         self.calls.lock().clone()
      }
   }

   #[async_trait]
   impl CommandRunner for RecordingRunner {
      async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
         let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
         self.calls.lock().push(line.clone());
         match &*self.fail_on.lock() {
            Some(needle) if line.contains(needle.as_str()) => {
               Err(DaemonError::CommandFailed(line))
            },
            _ => Ok(String::new()),
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_shell_output_is_combined() {
      let out = TokioRunner.run_shell("echo out; echo err >&2").await.unwrap();
      assert!(out.contains("out"));
      assert!(out.contains("err"));
   }

   #[tokio::test]
   async fn test_failure_carries_output() {
      let err = TokioRunner.run_shell("echo boom; exit 3").await.unwrap_err();
      match err {
         DaemonError::CommandFailed(msg) => assert!(msg.contains("boom")),
         other => panic!("unexpected error: {other}"),
      }
   }
}
