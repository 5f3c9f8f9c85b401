//! Filesystem and mount helpers.
//!
//! Everything goes through the `CommandRunner` port: `blkid`, `mkfs.*`, the
//! fsck tools, `mount`, `umount` and `mountpoint`.

use tracing::{debug, info, instrument};

use crate::adapters::format_command;
use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// Format reported for a device carrying a partition table. Never matches a
/// requested filesystem, so such a device is never formatted.
pub const PARTITIONED: &str = "unknown data, probably partitions";

/// `blkid` exit code when no requested token could be found.
const BLKID_NOTHING_FOUND: i32 = 2;

fn command_failed(program: &str, args: &[&str], output: CommandOutput) -> Error {
    Error::CommandFailed {
        command: format_command(program, args),
        output: output.output.trim().to_string(),
    }
}

/// Parse `blkid -o export` output into `(TYPE, PTTYPE)`.
///
/// Accepts both `KEY=value` and `KEY="value"` lines.
pub fn parse_blkid_export(output: &str) -> (Option<String>, Option<String>) {
    let mut fs_type = None;
    let mut pt_type = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_uppercase()) {
            continue;
        }
        let value = value.trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key {
            "TYPE" => fs_type = Some(value.to_string()),
            "PTTYPE" => pt_type = Some(value.to_string()),
            _ => {}
        }
    }

    (fs_type, pt_type)
}

/// Current format of a device, `None` when unformatted.
#[instrument(skip(runner))]
pub async fn get_disk_format(runner: &dyn CommandRunner, device: &str) -> Result<Option<String>> {
    let args = ["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device];
    let output = runner.run("blkid", &args).await?;
    debug!(output = %output.output, code = ?output.code, "blkid");

    if output.code == Some(BLKID_NOTHING_FOUND) {
        return Ok(None);
    }
    if !output.is_success() {
        return Err(command_failed("blkid", &args, output));
    }

    match parse_blkid_export(&output.output) {
        (_, Some(pt_type)) => {
            debug!(pt_type = %pt_type, "Device carries a partition table");
            Ok(Some(PARTITIONED.to_string()))
        }
        (fs_type, None) => Ok(fs_type),
    }
}

/// Make sure `device` holds a `fs_type` filesystem, creating it on a blank
/// device. A device formatted otherwise is never touched.
#[instrument(skip(runner))]
pub async fn ensure_fs_type(runner: &dyn CommandRunner, fs_type: &str, device: &str) -> Result<()> {
    let current = get_disk_format(runner, device).await?;
    debug!(current = ?current, "Detected filesystem");

    match current {
        Some(current) if current == fs_type => Ok(()),
        Some(current) => Err(Error::failed_precondition(format!(
            "Could not create {} filesystem on device {} since it already has one ({})",
            fs_type, device, current
        ))),
        None => {
            info!("Creating {} filesystem on device {}", fs_type, device);
            let program = format!("mkfs.{}", fs_type);
            let output = runner.run(&program, &[device]).await?;
            if output.is_success() {
                Ok(())
            } else {
                Err(command_failed(&program, &[device], output))
            }
        }
    }
}

/// Consistency check tool for a filesystem type. Every tool is run with
/// `-n` so that nothing gets repaired.
pub fn fsck_program(fs_type: &str) -> &'static str {
    match fs_type {
        "ext2" | "ext3" | "ext4" => "e2fsck",
        "xfs" => "xfs_repair",
        _ => "fsck",
    }
}

/// Check the filesystem on `device` without repairing it.
#[instrument(skip(runner))]
pub async fn check_fs(runner: &dyn CommandRunner, fs_type: &str, device: &str) -> Result<()> {
    info!("Checking filesystem at {}", device);
    let output = runner.run(fsck_program(fs_type), &["-n", device]).await?;
    if output.is_success() {
        Ok(())
    } else {
        Err(Error::Corruption(output.output.trim().to_string()))
    }
}

/// Whether `path` is a mount point. The output of `mountpoint` is returned
/// for diagnostics when it is not.
pub async fn is_mountpoint(runner: &dyn CommandRunner, path: &str) -> Result<(bool, String)> {
    let output = runner.run("mountpoint", &[path]).await?;
    Ok((output.is_success(), output.output.trim().to_string()))
}

#[instrument(skip(runner))]
pub async fn mount(runner: &dyn CommandRunner, fs_type: &str, device: &str, target: &str) -> Result<()> {
    let args = ["-t", fs_type, device, target];
    let output = runner.run("mount", &args).await?;
    if output.is_success() {
        Ok(())
    } else {
        Err(command_failed("mount", &args, output))
    }
}

#[instrument(skip(runner))]
pub async fn umount(runner: &dyn CommandRunner, target: &str) -> Result<()> {
    let output = runner.run("umount", &[target]).await?;
    if output.is_success() {
        Ok(())
    } else {
        Err(command_failed("umount", &[target], output))
    }
}
