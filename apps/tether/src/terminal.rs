use std::collections::VecDeque;
use std::io::{Read, Write};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 4096;
/// Startup output kept for the first viewer.
pub const BACKLOG_LIMIT: usize = 64 * 1024;

/// The host's shell running under a pseudo-terminal.
pub struct Pty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    /// Spawn `command` and start a reader thread. The receiver yields output
    /// chunks and closes when the shell exits.
    pub fn spawn(
        command: CommandBuilder,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size(cols, rows))?;
        let child = pair.slave.spawn_command(command)?;
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("tether-pty-reader".into())
            .spawn(move || {
                let mut buffer = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            if output_tx.send(buffer[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            tracing::debug!(target = "tether::pty", error = %err, "pty read ended");
                            break;
                        }
                    }
                }
            })?;

        let pty = Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
        };
        Ok((pty, output_rx))
    }

    /// `$SHELL`, falling back to `/bin/sh` (`cmd.exe` on Windows).
    pub fn default_shell() -> CommandBuilder {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            });
        let mut command = CommandBuilder::new(shell);
        if let Ok(cwd) = std::env::current_dir() {
            command.cwd(cwd);
        }
        command.env("TERM", "xterm-256color");
        command
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(anyhow!("refusing to resize pty to {cols}x{rows}"));
        }
        self.master.lock().resize(size(cols, rows))?;
        Ok(())
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(Some(_)))
    }

    pub fn kill(&self) {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.kill();
        }
    }
}

fn size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Bounded buffer of output produced while no viewer is attached. Oldest
/// bytes are discarded first.
#[derive(Debug)]
pub struct OutputBacklog {
    bytes: VecDeque<u8>,
    limit: usize,
}

impl OutputBacklog {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let chunk = if chunk.len() > self.limit {
            &chunk[chunk.len() - self.limit..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn take(&mut self) -> Vec<u8> {
        self.bytes.drain(..).collect()
    }
}

impl Default for OutputBacklog {
    fn default() -> Self {
        Self::new(BACKLOG_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn backlog_keeps_newest_bytes() {
        let mut backlog = OutputBacklog::new(8);
        backlog.push(b"hello ");
        backlog.push(b"world");
        assert_eq!(backlog.take(), b"lo world".to_vec());
        assert!(backlog.is_empty());

        backlog.push(b"0123456789abc");
        assert_eq!(backlog.take(), b"56789abc".to_vec());
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn spawned_command_output_is_streamed() {
        let mut command = CommandBuilder::new("echo");
        command.arg("tether-pty-check");
        let (pty, mut output) = Pty::spawn(command, 80, 24).expect("spawn");

        let mut collected = Vec::new();
        while let Some(chunk) = output.recv().await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains("tether-pty-check") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("tether-pty-check"));
        pty.kill();
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn input_reaches_the_child() {
        let (pty, mut output) = Pty::spawn(CommandBuilder::new("cat"), 80, 24).expect("spawn");
        pty.write(b"ping\n").expect("write");

        let mut collected = Vec::new();
        while let Some(chunk) = output.recv().await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains("ping") {
                break;
            }
        }
        pty.resize(120, 40).expect("resize");
        assert!(pty.resize(0, 10).is_err());
        pty.kill();
        assert!(pty.has_exited());
    }
}
