//! Fallback enumeration through an OS command that prints a table of
//! removable logical disks.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::core::enumerator::{MIN_VOLUME_GB, VolumeProvider, display_label};
use crate::core::models::{BYTES_PER_GB, VolumeDescriptor};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const NO_LABEL: &str = "No label";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// `wmic logicaldisk ... /format:csv`: `Node,DeviceID,Size,VolumeName`
    WmicCsv,
    /// `lsblk -b -P`: `KEY="value"` pairs per line
    LsblkPairs,
}

pub struct CommandTableProvider {
    program: &'static str,
    args: &'static [&'static str],
    format: TableFormat,
}

impl CommandTableProvider {
    pub fn wmic() -> Self {
        Self {
            program: "wmic",
            args: &[
                "logicaldisk",
                "where",
                "drivetype=2",
                "get",
                "deviceid,volumename,size",
                "/format:csv",
            ],
            format: TableFormat::WmicCsv,
        }
    }

    pub fn lsblk() -> Self {
        Self {
            program: "lsblk",
            args: &["-b", "-P", "-o", "MOUNTPOINT,LABEL,SIZE,RM"],
            format: TableFormat::LsblkPairs,
        }
    }

    /// The fallback for the current platform, if there is one.
    pub fn for_platform() -> Option<Self> {
        if cfg!(windows) {
            Some(Self::wmic())
        } else if cfg!(target_os = "linux") {
            Some(Self::lsblk())
        } else {
            None
        }
    }
}

#[async_trait]
impl VolumeProvider for CommandTableProvider {
    fn name(&self) -> &'static str {
        self.program
    }

    async fn list(&self) -> Result<Vec<VolumeDescriptor>> {
        let mut command = Command::new(self.program);
        command
            .args(self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| anyhow!("{} did not answer within {:?}", self.program, COMMAND_TIMEOUT))?
            .with_context(|| format!("Failed to run {}", self.program))?;

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_table(self.format, &text))
    }
}

pub fn parse_table(format: TableFormat, text: &str) -> Vec<VolumeDescriptor> {
    match format {
        TableFormat::WmicCsv => parse_wmic_csv(text),
        TableFormat::LsblkPairs => parse_lsblk_pairs(text),
    }
}

fn volume(id: &str, name: &str, size: &str) -> Option<VolumeDescriptor> {
    let capacity_bytes: u64 = size.trim().parse().ok()?;
    if (capacity_bytes as f64 / BYTES_PER_GB) < MIN_VOLUME_GB {
        return None;
    }
    let name = if name.trim().is_empty() { NO_LABEL } else { name.trim() };
    Some(VolumeDescriptor {
        id: id.to_string(),
        label: display_label(id, Some(name), capacity_bytes),
        capacity_bytes,
    })
}

/// Rows look like `NODE,E:,1977614336,CARD`. Rows without a size are empty slots.
fn parse_wmic_csv(text: &str) -> Vec<VolumeDescriptor> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split(',').collect();
            if parts.len() < 4 || parts[1].trim().is_empty() || parts[1].trim() == "DeviceID" {
                return None;
            }
            volume(parts[1].trim(), parts[3], parts[2])
        })
        .collect()
}

static PAIR_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#));

/// Only mounted, removable (`RM="1"`) entries are kept.
fn parse_lsblk_pairs(text: &str) -> Vec<VolumeDescriptor> {
    let Ok(re) = PAIR_RE.as_ref() else {
        return Vec::new();
    };

    text.lines()
        .filter_map(|line| {
            let mut mount = "";
            let mut label = "";
            let mut size = "";
            let mut removable = false;
            for caps in re.captures_iter(line) {
                let value = caps.get(2).map_or("", |m| m.as_str());
                match caps.get(1).map_or("", |m| m.as_str()) {
                    "MOUNTPOINT" => mount = value,
                    "LABEL" => label = value,
                    "SIZE" => size = value,
                    "RM" => removable = value == "1",
                    _ => {}
                }
            }
            if mount.is_empty() || !removable {
                return None;
            }
            volume(mount, label, size)
        })
        .collect()
}
