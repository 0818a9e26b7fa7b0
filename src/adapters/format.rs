use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::core::wiper::{FilesystemKind, Formatter};
use crate::error::FormatError;

/// Quick-format via the OS tools: `format.com` on Windows, `mkfs` on Linux.
pub struct SystemFormatter;

#[async_trait]
impl Formatter for SystemFormatter {
    async fn format(&self, volume: &Path, filesystem: FilesystemKind) -> Result<String, FormatError> {
        if cfg!(windows) {
            format_windows(volume, filesystem).await
        } else if cfg!(target_os = "linux") {
            format_linux(volume, filesystem).await
        } else {
            Err(FormatError::Unsupported)
        }
    }
}

async fn run(program: &str, args: &[String]) -> Result<String, FormatError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!(command = %command, "Running format tool");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| FormatError::Spawn {
            command: command.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if output.status.success() {
        Ok(stdout)
    } else {
        Err(FormatError::Exit {
            command,
            status: output.status.to_string(),
            output: if stderr.is_empty() { stdout } else { stderr },
        })
    }
}

async fn format_windows(volume: &Path, filesystem: FilesystemKind) -> Result<String, FormatError> {
    let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
    let format_exe = PathBuf::from(system_root).join("System32").join("format.com");
    let drive = volume.to_string_lossy().trim_end_matches('\\').to_string();

    run(
        &format_exe.to_string_lossy(),
        &[
            drive,
            format!("/FS:{}", filesystem.as_str()),
            "/Q".to_string(),
            "/Y".to_string(),
        ],
    )
    .await
}

/// Unmount, create a fresh filesystem on the backing device, mount it back.
async fn format_linux(volume: &Path, filesystem: FilesystemKind) -> Result<String, FormatError> {
    let mounts = tokio::fs::read_to_string("/proc/mounts")
        .await
        .map_err(|source| FormatError::Spawn {
            command: "read /proc/mounts".to_string(),
            source,
        })?;
    let device = device_for_mount_point(&mounts, volume)
        .ok_or_else(|| FormatError::DeviceNotFound(volume.to_path_buf()))?;
    let mount_point = volume.to_string_lossy().to_string();

    run("umount", &[mount_point.clone()]).await?;

    let (program, mut args) = match filesystem {
        FilesystemKind::Fat32 => ("mkfs.fat", vec!["-F".to_string(), "32".to_string()]),
        FilesystemKind::Exfat => ("mkfs.exfat", Vec::new()),
    };
    args.push(device.clone());
    let formatted = run(program, &args).await;

    // Remount even when mkfs failed so the volume does not vanish from the host.
    let remounted = run("mount", &[device, mount_point]).await;
    let output = formatted?;
    remounted?;
    Ok(output)
}

/// Decode the octal escapes `/proc/mounts` uses for spaces and tabs.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\134", "\\")
}

pub fn device_for_mount_point(mounts: &str, mount_point: &Path) -> Option<String> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let point = unescape_mount_field(fields.next()?);
        (Path::new(&point) == mount_point && device.starts_with("/dev/")).then(|| device.to_string())
    })
}
