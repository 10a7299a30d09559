use std::{
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, unbounded};
use image::{DynamicImage, ImageFormat};

/// Display surface. `poll_key` is called once per tick, after every image of
/// that tick has been presented.
pub trait Presenter {
    fn present(&mut self, label: &str, image: &DynamicImage) -> Result<()>;
    fn poll_key(&mut self) -> Option<char>;
    fn close(&mut self) -> Result<()>;
}

/// Writes each presented window as a PNG every `every` ticks.
pub struct SnapshotPresenter {
    out_dir: PathBuf,
    every: u64,
    tick: u64,
    written: u64,
    keys: Option<Receiver<char>>,
    closed: bool,
}

impl SnapshotPresenter {
    pub fn create(out_dir: &Path, every: u64) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            every: every.max(1),
            tick: 0,
            written: 0,
            keys: None,
            closed: false,
        })
    }

    /// Reads keys from stdin on a detached thread.
    pub fn with_stdin_keys(self) -> Self {
        let (tx, rx) = unbounded();
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                for key in line.chars() {
                    if tx.send(key).is_err() {
                        return;
                    }
                }
            }
        });
        self.with_keys(rx)
    }

    pub fn with_keys(mut self, keys: Receiver<char>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    pub fn snapshot_path(&self, label: &str) -> PathBuf {
        self.out_dir.join(format!("{}.png", sanitize_label(label)))
    }
}

impl Presenter for SnapshotPresenter {
    fn present(&mut self, label: &str, image: &DynamicImage) -> Result<()> {
        if self.tick % self.every != 0 {
            return Ok(());
        }
        let path = self.snapshot_path(label);
        image
            .save_with_format(&path, ImageFormat::Png)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.written += 1;
        log::debug!("wrote {}", path.display());
        Ok(())
    }

    fn poll_key(&mut self) -> Option<char> {
        self.tick += 1;
        self.keys.as_ref()?.try_recv().ok()
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.keys.take();
            log::info!(
                "wrote {} snapshots to {} over {} ticks",
                self.frames_written(),
                self.out_dir.display(),
                self.tick
            );
        }
        Ok(())
    }
}

/// `"depth (device 0)"` becomes `"depth_device_0"`.
pub fn sanitize_label(label: &str) -> String {
    let mut name = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('_') && !name.is_empty() {
            name.push('_');
        }
    }
    while name.ends_with('_') {
        name.pop();
    }
    if name.is_empty() {
        name.push_str("window");
    }
    name
}
