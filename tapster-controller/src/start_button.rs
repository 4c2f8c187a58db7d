//! Hardware start button on a serial line.
//!
//! The button firmware prints lines such as `id=start_button,state=1` at a
//! fixed rate. A press is the falling edge from 1 to 0.

use crate::demo_config::ButtonConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lines read from a candidate port before giving up on it
const IDENTIFICATION_LINES: usize = 4;
const IDENTIFICATION_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LineError {
    #[error("no state field in {0:?}")]
    MissingState(String),
    #[error("invalid state in {0:?}")]
    InvalidState(String),
}

pub fn parse_state(line: &str) -> Result<u8, LineError> {
    let value = line
        .split(',')
        .find_map(|field| field.trim().strip_prefix("state="))
        .ok_or_else(|| LineError::MissingState(line.to_owned()))?;
    value
        .trim()
        .parse()
        .map_err(|_| LineError::InvalidState(line.to_owned()))
}

/// Looks for the button among the serial devices in `/dev`
pub async fn find_button_port(config: &ButtonConfig) -> Option<PathBuf> {
    find_button_port_in(Path::new("/dev"), config).await
}

pub async fn find_button_port_in(dir: &Path, config: &ButtonConfig) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            error!(?dir, %error, "failed to list serial devices");
            return None;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry
            .file_name()
            .to_string_lossy()
            .contains(&config.port_pattern)
        {
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    let identifier = config.identifier.to_lowercase();
    for port in candidates {
        match identifies(&port, &identifier).await {
            Ok(true) => {
                info!(?port, "found start button");
                return Some(port);
            }
            Ok(false) => debug!(?port, "not a start button"),
            Err(error) => error!(?port, %error, "Serial exception"),
        }
    }
    None
}

async fn identifies(port: &Path, identifier: &str) -> std::io::Result<bool> {
    let mut reader = BufReader::new(File::open(port).await?);
    let mut buffer = Vec::new();
    for _ in 0..IDENTIFICATION_LINES {
        buffer.clear();
        let read = tokio::time::timeout(
            IDENTIFICATION_TIMEOUT,
            reader.read_until(b'\n', &mut buffer),
        )
        .await;
        let read = match read {
            Ok(read) => read?,
            Err(_) => return Ok(false),
        };
        if read == 0 {
            return Ok(false);
        }
        if decode_line(&buffer).to_lowercase().contains(identifier) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Bytes that are not UTF-8 become replacement characters
fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub async fn open_button(port: &Path) -> std::io::Result<BufReader<File>> {
    Ok(BufReader::new(File::open(port).await?))
}

/// Turns the state lines of the button into presses
#[derive(Debug, Clone)]
pub struct ButtonListener {
    poll_interval: Duration,
    previous_state: u8,
}

impl ButtonListener {
    pub fn new(config: &ButtonConfig) -> Self {
        ButtonListener {
            poll_interval: config.poll_interval(),
            previous_state: 1,
        }
    }

    /// Feeds one line, true when it completes a press
    pub fn feed(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        match parse_state(line) {
            Ok(state) => {
                let pressed = self.previous_state == 1 && state == 0;
                self.previous_state = state;
                pressed
            }
            Err(error) => {
                warn!(%error, "discarding button line");
                false
            }
        }
    }

    /// Reads lines until the source ends or `shutdown` turns true.
    ///
    /// Returns the number of presses seen.
    pub async fn run<R, F>(
        mut self,
        mut reader: R,
        mut shutdown: watch::Receiver<bool>,
        mut on_press: F,
    ) -> std::io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
        F: FnMut(),
    {
        // a line cut short by a shutdown change stays here until it completes
        let mut buffer = Vec::new();
        let mut presses = 0;
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                read = reader.read_until(b'\n', &mut buffer) => {
                    if read? == 0 {
                        break;
                    }
                    let line = decode_line(&buffer);
                    buffer.clear();
                    if self.feed(&line) {
                        presses += 1;
                        info!(presses, "start button pressed");
                        on_press();
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        Ok(presses)
    }
}
