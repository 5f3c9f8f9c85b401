//! iscsiadm Transport Adapter
//!
//! Implements the `IscsiTransport` port on top of open-iscsi's `iscsiadm`
//! and multipath-tools, resolving devices through udev's by-path links.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::adapters::command::format_command;
use crate::domain::ports::{CommandRunner, Connector, IscsiTransport, TargetInfo};
use crate::error::{Error, Result};

/// iscsiadm exit code for "no matching sessions/records".
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// iscsiadm exit code for "session already exists".
const ISCSI_ERR_SESS_EXISTS: i32 = 15;

const DEFAULT_ISCSI_PORT: &str = "3260";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the iscsiadm transport
#[derive(Debug, Clone)]
pub struct IscsiConfig {
    /// How long to wait for a LUN's block device to show up after login
    pub device_wait_timeout: Duration,

    /// Interval between device checks
    pub device_poll_interval: Duration,

    /// Directory holding udev by-path links
    pub by_path_dir: PathBuf,

    /// sysfs block directory, used to find multipath holders
    pub sys_block_dir: PathBuf,
}

impl Default for IscsiConfig {
    fn default() -> Self {
        Self {
            device_wait_timeout: Duration::from_secs(10),
            device_poll_interval: Duration::from_millis(250),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            sys_block_dir: PathBuf::from("/sys/block"),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// iSCSI transport driving `iscsiadm`.
#[derive(Clone)]
pub struct IscsiadmTransport {
    config: IscsiConfig,
    runner: Arc<dyn CommandRunner>,
}

impl IscsiadmTransport {
    pub fn new(config: IscsiConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Portal with the default port appended when none is given.
    fn portal_with_port(portal: &str) -> String {
        if portal.contains(':') {
            portal.to_string()
        } else {
            format!("{}:{}", portal, DEFAULT_ISCSI_PORT)
        }
    }

    /// udev by-path link of a LUN behind a target.
    fn by_path_link(&self, target: &TargetInfo, lun: i32) -> PathBuf {
        self.config.by_path_dir.join(format!(
            "ip-{}-iscsi-{}-lun-{}",
            Self::portal_with_port(&target.portal),
            target.iqn,
            lun
        ))
    }

    fn iscsiadm_error(args: &[&str], output: &str) -> Error {
        Error::Transport(format!(
            "{}: {}",
            format_command("iscsiadm", args),
            output.trim()
        ))
    }

    async fn discover(&self, target: &TargetInfo) -> Result<()> {
        let portal = Self::portal_with_port(&target.portal);
        let args = [
            "-m",
            "discoverydb",
            "-t",
            "sendtargets",
            "-p",
            portal.as_str(),
            "-o",
            "new",
            "--discover",
        ];
        let out = self.runner.run("iscsiadm", &args).await?;
        if out.is_success() {
            Ok(())
        } else {
            Err(Self::iscsiadm_error(&args, &out.output))
        }
    }

    async fn login(&self, target: &TargetInfo) -> Result<()> {
        let portal = Self::portal_with_port(&target.portal);
        let args = ["-m", "node", "-T", target.iqn.as_str(), "-p", portal.as_str(), "-l"];
        let out = self.runner.run("iscsiadm", &args).await?;
        if out.is_success() {
            return Ok(());
        }
        if out.code == Some(ISCSI_ERR_SESS_EXISTS) || out.output.contains("already present") {
            debug!(iqn = %target.iqn, portal = %portal, "Session already exists");
            return Ok(());
        }
        Err(Self::iscsiadm_error(&args, &out.output))
    }

    async fn logout(&self, target: &TargetInfo) -> Result<()> {
        let portal = Self::portal_with_port(&target.portal);
        let args = ["-m", "node", "-T", target.iqn.as_str(), "-p", portal.as_str(), "-u"];
        let out = self.runner.run("iscsiadm", &args).await?;
        if out.is_success() {
            return Ok(());
        }
        if out.code == Some(ISCSI_ERR_NO_OBJS_FOUND) || out.output.contains("No matching sessions") {
            debug!(iqn = %target.iqn, portal = %portal, "No session to log out of");
            return Ok(());
        }
        Err(Self::iscsiadm_error(&args, &out.output))
    }

    /// Wait for the by-path link to appear and resolve it to the real device.
    async fn wait_for_device(&self, link: &Path) -> Option<String> {
        let start = Instant::now();
        loop {
            if let Ok(device) = tokio::fs::canonicalize(link).await {
                return Some(device.to_string_lossy().into_owned());
            }
            if start.elapsed() >= self.config.device_wait_timeout {
                return None;
            }
            sleep(self.config.device_poll_interval).await;
        }
    }

    /// Remove a SCSI device from the kernel through sysfs.
    async fn delete_scsi_device(&self, device: &str) {
        let Some(name) = Path::new(device).file_name() else {
            return;
        };
        let delete = self.config.sys_block_dir.join(name).join("device").join("delete");
        match tokio::fs::write(&delete, b"1").await {
            Ok(()) => debug!(device = %device, "SCSI device deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(device = %device, "SCSI device already gone");
            }
            Err(e) => warn!(device = %device, error = %e, "Could not delete SCSI device"),
        }
    }

    /// Whether a by-path link of another LUN remains behind `target`.
    async fn target_serves_other_luns(&self, target: &TargetInfo, lun: i32) -> bool {
        let prefix = format!(
            "ip-{}-iscsi-{}-lun-",
            Self::portal_with_port(&target.portal),
            target.iqn
        );

        let Ok(mut entries) = tokio::fs::read_dir(&self.config.by_path_dir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let other = rest.split('-').next().and_then(|n| n.parse::<i32>().ok());
            if other.is_some_and(|other| other != lun) {
                return true;
            }
        }
        false
    }

    /// Device-mapper device holding the given path devices, if any.
    async fn find_multipath_device(&self, devices: &[String]) -> Option<String> {
        let first = devices.first()?;
        let name = Path::new(first).file_name()?.to_str()?;
        let holders = self.config.sys_block_dir.join(name).join("holders");

        let mut entries = tokio::fs::read_dir(&holders).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let holder = entry.file_name().to_string_lossy().into_owned();
            if holder.starts_with("dm-") {
                return Some(format!("/dev/{}", holder));
            }
        }
        None
    }
}

impl std::fmt::Debug for IscsiadmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiadmTransport")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl IscsiTransport for IscsiadmTransport {
    #[instrument(skip(self, connector), fields(lun = connector.lun))]
    async fn connect(&self, connector: &mut Connector) -> Result<String> {
        let mut devices = Vec::new();
        let mut last_error = None;

        for target in &connector.targets {
            if connector.do_discovery {
                if let Err(e) = self.discover(target).await {
                    warn!(portal = %target.portal, error = %e, "Discovery failed, skipping portal");
                    last_error = Some(e);
                    continue;
                }
            }

            if let Err(e) = self.login(target).await {
                warn!(portal = %target.portal, error = %e, "Login failed, skipping portal");
                last_error = Some(e);
                continue;
            }

            let link = self.by_path_link(target, connector.lun);
            match self.wait_for_device(&link).await {
                Some(device) => {
                    debug!(portal = %target.portal, device = %device, "Device found");
                    if !devices.contains(&device) {
                        devices.push(device);
                    }
                }
                None => {
                    warn!(link = %link.display(), "Device did not appear in time");
                    last_error = Some(Error::Transport(format!(
                        "device {} did not appear",
                        link.display()
                    )));
                }
            }
        }

        if devices.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                Error::Transport("no iSCSI target to connect to".to_string())
            }));
        }

        connector.devices = devices;
        connector.multipath_device = None;

        if connector.devices.len() > 1 {
            match self.find_multipath_device(&connector.devices).await {
                Some(dm) => {
                    info!(device = %dm, paths = connector.devices.len(), "Multipath device found");
                    connector.multipath_device = Some(dm.clone());
                    return Ok(dm);
                }
                None => warn!(
                    paths = connector.devices.len(),
                    "Several paths but no multipath device, using the first path"
                ),
            }
        }

        Ok(connector.devices[0].clone())
    }

    #[instrument(skip(self, connector), fields(lun = connector.lun))]
    async fn disconnect(&self, connector: &Connector) -> Result<()> {
        if let Some(dm) = &connector.multipath_device {
            let out = self.runner.run("multipath", &["-f", dm.as_str()]).await?;
            if !out.is_success() {
                return Err(Error::Transport(format!(
                    "could not flush multipath device {}: {}",
                    dm,
                    out.output.trim()
                )));
            }
        }

        for device in &connector.devices {
            let out = self
                .runner
                .run("blockdev", &["--flushbufs", device.as_str()])
                .await?;
            if !out.is_success() {
                warn!(device = %device, output = %out.output.trim(), "Could not flush device buffers");
            }
            self.delete_scsi_device(device).await;
        }

        for target in &connector.targets {
            if self.target_serves_other_luns(target, connector.lun).await {
                info!(iqn = %target.iqn, portal = %target.portal, "Target still serves other LUNs, keeping session");
                continue;
            }

            self.logout(target).await?;

            let portal = Self::portal_with_port(&target.portal);
            let args = [
                "-m",
                "node",
                "-T",
                target.iqn.as_str(),
                "-p",
                portal.as_str(),
                "-o",
                "delete",
            ];
            let out = self.runner.run("iscsiadm", &args).await?;
            if !out.is_success() {
                debug!(output = %out.output.trim(), "Could not delete node record");
            }
        }

        info!(targets = connector.targets.len(), "iSCSI device detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        fail_login_for: Option<String>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            let line = format_command(program, args);
            self.calls.lock().push(line.clone());
            if let Some(portal) = &self.fail_login_for {
                if line.contains(portal.as_str()) && line.ends_with("-l") {
                    return Ok(CommandOutput::failure(8, "iscsiadm: connection timed out"));
                }
            }
            if line.ends_with("-u") {
                return Ok(CommandOutput::failure(
                    ISCSI_ERR_NO_OBJS_FOUND,
                    "iscsiadm: No matching sessions found",
                ));
            }
            Ok(CommandOutput::success(""))
        }
    }

    fn transport(dir: &Path, runner: Arc<RecordingRunner>) -> IscsiadmTransport {
        IscsiadmTransport::new(
            IscsiConfig {
                device_wait_timeout: Duration::from_millis(50),
                device_poll_interval: Duration::from_millis(10),
                by_path_dir: dir.join("by-path"),
                sys_block_dir: dir.join("sys-block"),
            },
            runner,
        )
    }

    /// Create a by-path link to a fake device node.
    fn fake_lun(dir: &Path, portal: &str, iqn: &str, lun: i32, device: &str) -> PathBuf {
        let dev = dir.join(device);
        std::fs::write(&dev, b"").unwrap();
        std::fs::create_dir_all(dir.join("by-path")).unwrap();
        std::os::unix::fs::symlink(
            &dev,
            dir.join("by-path")
                .join(format!("ip-{}-iscsi-{}-lun-{}", portal, iqn, lun)),
        )
        .unwrap();
        dev.canonicalize().unwrap()
    }

    #[test]
    fn test_portal_with_port() {
        assert_eq!(IscsiadmTransport::portal_with_port("10.0.0.1"), "10.0.0.1:3260");
        assert_eq!(IscsiadmTransport::portal_with_port("10.0.0.1:3261"), "10.0.0.1:3261");
    }

    #[tokio::test]
    async fn test_connect_single_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = fake_lun(tmp.path(), "10.0.0.1:3260", "iqn.test", 2, "sdb");
        let runner = Arc::new(RecordingRunner::default());
        let transport = transport(tmp.path(), runner.clone());

        let mut connector = Connector::new("iqn.test", ["10.0.0.1:3260"], 2);
        let device = transport.connect(&mut connector).await.unwrap();

        assert_eq!(device, dev.to_string_lossy());
        assert_eq!(connector.devices.len(), 1);
        assert!(connector.multipath_device.is_none());

        let calls = runner.calls.lock().clone();
        assert!(calls[0].contains("discoverydb"));
        assert_eq!(calls[1], "iscsiadm -m node -T iqn.test -p 10.0.0.1:3260 -l");
    }

    #[tokio::test]
    async fn test_connect_multipath_uses_holder() {
        let tmp = tempfile::tempdir().unwrap();
        fake_lun(tmp.path(), "10.0.0.1:3260", "iqn.test", 1, "sdb");
        fake_lun(tmp.path(), "10.0.0.2:3260", "iqn.test", 1, "sdc");
        std::fs::create_dir_all(tmp.path().join("sys-block/sdb/holders/dm-3")).unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let transport = transport(tmp.path(), runner);

        let mut connector = Connector::new("iqn.test", ["10.0.0.1:3260", "10.0.0.2:3260"], 1);
        let device = transport.connect(&mut connector).await.unwrap();

        assert_eq!(device, "/dev/dm-3");
        assert!(connector.is_multipath());
        assert_eq!(connector.multipath_device.as_deref(), Some("/dev/dm-3"));
    }

    #[tokio::test]
    async fn test_connect_skips_failing_portal() {
        let tmp = tempfile::tempdir().unwrap();
        fake_lun(tmp.path(), "10.0.0.2:3260", "iqn.test", 0, "sdc");
        let runner = Arc::new(RecordingRunner {
            fail_login_for: Some("10.0.0.1:3260".to_string()),
            ..Default::default()
        });
        let transport = transport(tmp.path(), runner);

        let mut connector = Connector::new("iqn.test", ["10.0.0.1", "10.0.0.2"], 0);
        transport.connect(&mut connector).await.unwrap();
        assert_eq!(connector.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_device_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let transport = transport(tmp.path(), runner);

        let mut connector = Connector::new("iqn.test", ["10.0.0.1:3260"], 5);
        let result = transport.connect(&mut connector).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_disconnect_tolerates_missing_session() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let transport = transport(tmp.path(), runner.clone());

        let mut connector = Connector::new("iqn.test", ["10.0.0.1:3260"], 2);
        connector.devices = vec!["/dev/sdb".to_string()];
        connector.multipath_device = Some("/dev/dm-0".to_string());

        transport.disconnect(&connector).await.unwrap();

        let calls = runner.calls.lock().clone();
        assert_eq!(calls[0], "multipath -f /dev/dm-0");
        assert_eq!(calls[1], "blockdev --flushbufs /dev/sdb");
        assert!(calls[2].ends_with("-u"));
        assert!(calls[3].ends_with("-o delete"));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_session_shared_with_other_lun() {
        let tmp = tempfile::tempdir().unwrap();
        let sdb = fake_lun(tmp.path(), "10.0.0.1:3260", "iqn.test", 1, "sdb");
        fake_lun(tmp.path(), "10.0.0.1:3260", "iqn.test", 2, "sdc");
        let sysfs = tmp.path().join("sys-block/sdb/device");
        std::fs::create_dir_all(&sysfs).unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let transport = transport(tmp.path(), runner.clone());

        let mut connector = Connector::new("iqn.test", ["10.0.0.1:3260"], 1);
        connector.devices = vec![sdb.to_string_lossy().into_owned()];
        transport.disconnect(&connector).await.unwrap();

        let calls = runner.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("blockdev --flushbufs"));
        assert_eq!(std::fs::read(sysfs.join("delete")).unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_disconnect_last_lun_logs_out() {
        let tmp = tempfile::tempdir().unwrap();
        let sdb = fake_lun(tmp.path(), "10.0.0.1:3260", "iqn.test", 1, "sdb");
        fake_lun(tmp.path(), "10.0.0.1:3260", "iqn.other", 2, "sdc");
        let runner = Arc::new(RecordingRunner::default());
        let transport = transport(tmp.path(), runner.clone());

        let mut connector = Connector::new("iqn.test", ["10.0.0.1"], 1);
        connector.devices = vec![sdb.to_string_lossy().into_owned()];
        transport.disconnect(&connector).await.unwrap();

        let calls = runner.calls.lock().clone();
        assert_eq!(calls[1], "iscsiadm -m node -T iqn.test -p 10.0.0.1:3260 -u");
        assert!(calls[2].ends_with("-o delete"));
    }
}
