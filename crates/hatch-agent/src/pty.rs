//! PTY wrapper using portable-pty.
//!
//! The master side is blocking; callers move the reader and writer onto
//! blocking threads and keep the handle for resize, kill and wait.

use hatch_core::{HatchError, HatchResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    cols: u16,
    rows: u16,
}

impl PtyHandle {
    /// Spawn `shell` on a new PTY, or `shell -c command` when a command is given.
    pub fn spawn(
        shell: &str,
        command: Option<&str>,
        cols: u16,
        rows: u16,
        env: &BTreeMap<String, String>,
    ) -> HatchResult<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| HatchError::Other(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        if let Some(command) = command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HatchError::Other(format!("failed to spawn {shell}: {e}")))?;
        // The child holds its own copy of the slave.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HatchError::Other(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HatchError::Other(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        info!(cols, rows, pid = ?child.process_id(), "PTY spawned");
        Ok(Self {
            master: pair.master,
            child: Some(child),
            killer,
            reader: Some(reader),
            writer: Some(writer),
            cols,
            rows,
        })
    }

    pub fn take_reader(&mut self) -> HatchResult<Box<dyn Read + Send>> {
        self.reader
            .take()
            .ok_or_else(|| HatchError::Other("PTY reader already taken".into()))
    }

    pub fn take_writer(&mut self) -> HatchResult<Box<dyn Write + Send>> {
        self.writer
            .take()
            .ok_or_else(|| HatchError::Other("PTY writer already taken".into()))
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> HatchResult<()> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| HatchError::Other(format!("PTY resize failed: {e}")))?;
        self.cols = cols;
        self.rows = rows;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            debug!(error = %e, "PTY kill failed");
        }
    }

    /// Wait for the child on a blocking thread. The child can be awaited once.
    pub fn spawn_wait(&mut self) -> HatchResult<JoinHandle<HatchResult<i32>>> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| HatchError::Other("PTY child already awaited".into()))?;
        Ok(tokio::task::spawn_blocking(move || {
            let status = child
                .wait()
                .map_err(|e| HatchError::Other(format!("wait error: {e}")))?;
            let code = i32::try_from(status.exit_code()).unwrap_or(-1);
            info!(code, "PTY child exited");
            Ok(code)
        }))
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
