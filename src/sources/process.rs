// ============================================================================
// NGINX PROCESS & WORKER SOURCES
// ============================================================================
// Locates the nginx master through procfs and sums resource usage across its
// worker processes. The procfs reads sit behind `ProcessInspector` so the
// worker arithmetic can be exercised against fake process tables.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use super::{instance_overrides, Source, SourceContext, NS_NGINX, NS_PLUS};
use crate::config::NginxCollectorConfig;
use crate::delta::counter_delta;
use crate::error::{SourceError, SourceResult};
use crate::logging::SourceLogger;
use crate::model::{DimOverrides, NamedMetric, SimpleMetric, StatsEntity};

static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
});

static CLOCK_TICKS: Lazy<f64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
});

const MASTER_CMDLINE: &str = "nginx: master process";
const CACHE_PROCESSES: [&str; 2] = ["cache manager process", "cache loader process"];

// ----------------------------------------------------------------------------
// 10.1 Process Inspector
// ----------------------------------------------------------------------------

/// How the nginx master is found: explicit pid, pid file, or a scan for the
/// master cmdline (optionally narrowed by binary path).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterTarget {
    pub pid: Option<u32>,
    pub pid_file: Option<PathBuf>,
    pub bin_path: String,
}

impl MasterTarget {
    pub fn from_config(config: &NginxCollectorConfig) -> Self {
        Self {
            pid: config.pid,
            pid_file: config.pid_file.clone(),
            bin_path: config.bin_path.clone(),
        }
    }
}

/// Resource usage of one process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStats {
    /// User CPU time in seconds
    pub user_secs: f64,
    /// System CPU time in seconds
    pub system_secs: f64,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub fds: u64,
    /// Hard limit on open files
    pub nofile_hard: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Read access to the process table.
pub trait ProcessInspector: Send + Sync {
    fn master_pid(&self, target: &MasterTarget) -> SourceResult<u32>;
    fn children(&self, pid: u32) -> SourceResult<Vec<u32>>;
    fn cmdline(&self, pid: u32) -> SourceResult<String>;
    fn stats(&self, pid: u32) -> SourceResult<ProcessStats>;
    /// Host memory in bytes
    fn total_memory(&self) -> SourceResult<u64>;
}

/// `ProcessInspector` over a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    proc_root: PathBuf,
}

impl ProcfsInspector {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    fn read(&self, path: &Path) -> SourceResult<String> {
        fs::read_to_string(path).map_err(|e| SourceError::io(path, e))
    }

    fn pids(&self) -> SourceResult<Vec<u32>> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| SourceError::io(&self.proc_root, e))?;
        Ok(entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect())
    }

    /// Fields after the `(comm)` of /proc/<pid>/stat. comm may hold spaces.
    fn stat_fields(&self, pid: u32) -> SourceResult<Vec<String>> {
        let path = self.pid_dir(pid).join("stat");
        let raw = self.read(&path)?;
        let rest = raw
            .rsplit_once(')')
            .map(|(_, rest)| rest)
            .ok_or_else(|| SourceError::parse(path.display().to_string(), "missing comm"))?;
        Ok(rest.split_whitespace().map(str::to_string).collect())
    }
}

pub(crate) fn parse_nofile_hard(limits: &str) -> Option<u64> {
    let line = limits.lines().find(|l| l.starts_with("Max open files"))?;
    line.split_whitespace().nth(4)?.parse().ok()
}

pub(crate) fn parse_io_bytes(io: &str) -> (u64, u64) {
    let mut read = 0;
    let mut write = 0;
    for line in io.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "read_bytes" => read = value,
                "write_bytes" => write = value,
                _ => {}
            }
        }
    }
    (read, write)
}

impl ProcessInspector for ProcfsInspector {
    fn master_pid(&self, target: &MasterTarget) -> SourceResult<u32> {
        if let Some(pid) = target.pid {
            return if self.pid_dir(pid).exists() {
                Ok(pid)
            } else {
                Err(SourceError::ProcessNotFound { pid })
            };
        }

        if let Some(pid_file) = &target.pid_file {
            let raw = self.read(pid_file)?;
            let pid: u32 = raw
                .trim()
                .parse()
                .map_err(|e| SourceError::parse(pid_file.display().to_string(), e))?;
            return if self.pid_dir(pid).exists() {
                Ok(pid)
            } else {
                Err(SourceError::ProcessNotFound { pid })
            };
        }

        let mut candidates: Vec<u32> = self
            .pids()?
            .into_iter()
            .filter(|pid| {
                self.cmdline(*pid).is_ok_and(|cmd| {
                    cmd.starts_with(MASTER_CMDLINE)
                        && (target.bin_path.is_empty() || cmd.contains(&target.bin_path))
                })
            })
            .collect();
        candidates.sort_unstable();
        candidates.first().copied().ok_or_else(|| SourceError::Unsupported {
            message: "no nginx master process found".into(),
        })
    }

    fn children(&self, pid: u32) -> SourceResult<Vec<u32>> {
        let mut children: Vec<u32> = self
            .pids()?
            .into_iter()
            .filter(|child| {
                self.stat_fields(*child)
                    .ok()
                    .and_then(|fields| fields.get(1).and_then(|ppid| ppid.parse::<u32>().ok()))
                    == Some(pid)
            })
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    fn cmdline(&self, pid: u32) -> SourceResult<String> {
        let path = self.pid_dir(pid).join("cmdline");
        let raw = fs::read(&path).map_err(|e| SourceError::io(&path, e))?;
        Ok(String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn stats(&self, pid: u32) -> SourceResult<ProcessStats> {
        let dir = self.pid_dir(pid);
        let fields = self.stat_fields(pid)?;
        let ticks = |i: usize| fields.get(i).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);

        let statm_path = dir.join("statm");
        let statm = self.read(&statm_path)?;
        let mut pages = statm.split_whitespace().map(|v| v.parse::<u64>().unwrap_or(0));
        let vms_pages = pages.next().unwrap_or(0);
        let rss_pages = pages.next().unwrap_or(0);

        // fd and io need the same privileges as the target; missing means 0
        let fds = fs::read_dir(dir.join("fd")).map(|d| d.count() as u64).unwrap_or(0);
        let nofile_hard = self
            .read(&dir.join("limits"))
            .ok()
            .and_then(|l| parse_nofile_hard(&l))
            .unwrap_or(0);
        let (read_bytes, write_bytes) = self
            .read(&dir.join("io"))
            .map(|io| parse_io_bytes(&io))
            .unwrap_or((0, 0));

        Ok(ProcessStats {
            user_secs: ticks(11) / *CLOCK_TICKS,
            system_secs: ticks(12) / *CLOCK_TICKS,
            rss_bytes: rss_pages * *PAGE_SIZE,
            vms_bytes: vms_pages * *PAGE_SIZE,
            fds,
            nofile_hard,
            read_bytes,
            write_bytes,
        })
    }

    fn total_memory(&self) -> SourceResult<u64> {
        let meminfo = self.read(&self.proc_root.join("meminfo"))?;
        Ok(super::system::parse_meminfo(&meminfo)
            .get("MemTotal")
            .copied()
            .unwrap_or(0))
    }
}

// ----------------------------------------------------------------------------
// 10.2 Worker Totals
// ----------------------------------------------------------------------------

/// Sums over all worker processes of one master.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkerTotals {
    pub count: u64,
    pub rlimit_nofile: u64,
    pub user_secs: f64,
    pub system_secs: f64,
    pub fds: u64,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub rss_pct: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl WorkerTotals {
    /// Walk the master's children, skipping cache manager/loader processes.
    pub fn gather(inspector: &dyn ProcessInspector, target: &MasterTarget) -> SourceResult<Self> {
        let master = inspector.master_pid(target)?;
        let total_memory = inspector.total_memory().unwrap_or(0) as f64;

        let mut totals = Self::default();
        for pid in inspector.children(master)? {
            let cmdline = inspector.cmdline(pid).unwrap_or_default();
            if CACHE_PROCESSES.iter().any(|p| cmdline.contains(p)) {
                continue;
            }
            // a worker may exit between listing and reading
            let stats = match inspector.stats(pid) {
                Ok(stats) => stats,
                Err(e) => {
                    debug!(target: "nginx_telemetry::source::worker", pid, error = %e, "Skipping worker");
                    continue;
                }
            };

            totals.count += 1;
            totals.rlimit_nofile = totals.rlimit_nofile.max(stats.nofile_hard);
            totals.user_secs += stats.user_secs;
            totals.system_secs += stats.system_secs;
            totals.fds += stats.fds;
            totals.rss_bytes += stats.rss_bytes;
            totals.vms_bytes += stats.vms_bytes;
            if total_memory > 0.0 {
                totals.rss_pct += stats.rss_bytes as f64 / total_memory * 100.0;
            }
            totals.read_bytes += stats.read_bytes;
            totals.write_bytes += stats.write_bytes;
        }
        Ok(totals)
    }

    fn metrics(&self, prev: &WorkerTotals) -> Vec<SimpleMetric> {
        let user = counter_delta(self.user_secs, prev.user_secs);
        let system = counter_delta(self.system_secs, prev.system_secs);

        NamedMetric::new(NS_NGINX, "workers").convert([
            ("count", self.count as f64),
            ("rlimit_nofile", self.rlimit_nofile as f64),
            ("cpu.user", user),
            ("cpu.system", system),
            ("cpu.total", user + system),
            ("fds_count", self.fds as f64),
            ("mem.vms", self.vms_bytes as f64),
            ("mem.rss", self.rss_bytes as f64),
            ("mem.rss_pct", self.rss_pct),
            ("io.kbs_r", counter_delta(self.read_bytes, prev.read_bytes) as f64 / 1000.0),
            ("io.kbs_w", counter_delta(self.write_bytes, prev.write_bytes) as f64 / 1000.0),
        ])
    }
}

// ----------------------------------------------------------------------------
// 10.3 Worker Source
// ----------------------------------------------------------------------------

/// `nginx.workers.*` summed across the master's workers.
pub struct NginxWorker {
    inspector: Arc<dyn ProcessInspector>,
    target: Mutex<MasterTarget>,
    overrides: Mutex<DimOverrides>,
    prev: Mutex<Option<WorkerTotals>>,
    logger: SourceLogger,
}

impl NginxWorker {
    pub fn new(inspector: Arc<dyn ProcessInspector>, config: &NginxCollectorConfig) -> Self {
        Self {
            inspector,
            target: Mutex::new(MasterTarget::from_config(config)),
            overrides: Mutex::new(instance_overrides(config)),
            prev: Mutex::new(None),
            logger: SourceLogger::new("nginx_worker"),
        }
    }
}

#[async_trait]
impl Source for NginxWorker {
    fn name(&self) -> &'static str {
        "nginx_worker"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let inspector = self.inspector.clone();
        let target = self.target.lock().clone();
        let gathered = tokio::task::spawn_blocking(move || WorkerTotals::gather(inspector.as_ref(), &target))
            .await
            .map_err(|e| SourceError::Unsupported {
                message: format!("worker scan aborted: {}", e),
            })?;

        let current = match gathered {
            Ok(totals) => {
                self.logger.reset();
                totals
            }
            Err(e) => {
                self.logger.log(&format!("Failed to read nginx worker processes: {}", e));
                return Err(e);
            }
        };

        let metrics = {
            let mut prev = self.prev.lock();
            let baseline = prev.unwrap_or(current);
            *prev = Some(current);
            current.metrics(&baseline)
        };
        let overrides = self.overrides.lock().clone();
        ctx.send(StatsEntity::new(Vec::new(), metrics).with_overrides(overrides))
            .await;
        Ok(())
    }

    async fn update(&self, config: &NginxCollectorConfig) {
        *self.overrides.lock() = instance_overrides(config);
        let target = MasterTarget::from_config(config);
        let mut current = self.target.lock();
        if *current != target {
            *current = target;
            *self.prev.lock() = None;
        }
    }
}

// ----------------------------------------------------------------------------
// 10.4 Process Source
// ----------------------------------------------------------------------------

/// `plus.instance.count`: 1 while the instance is monitored through the
/// Plus API, 0 otherwise.
pub struct NginxProcess {
    plus: Mutex<bool>,
    overrides: Mutex<DimOverrides>,
}

impl NginxProcess {
    pub fn new(config: &NginxCollectorConfig) -> Self {
        Self {
            plus: Mutex::new(config.is_plus()),
            overrides: Mutex::new(instance_overrides(config)),
        }
    }
}

#[async_trait]
impl Source for NginxProcess {
    fn name(&self) -> &'static str {
        "nginx_process"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let count = if *self.plus.lock() { 1.0 } else { 0.0 };
        let metrics = NamedMetric::new(NS_PLUS, "instance").convert([("count", count)]);
        let overrides = self.overrides.lock().clone();
        ctx.send(StatsEntity::new(Vec::new(), metrics).with_overrides(overrides))
            .await;
        Ok(())
    }

    async fn update(&self, config: &NginxCollectorConfig) {
        *self.plus.lock() = config.is_plus();
        *self.overrides.lock() = instance_overrides(config);
    }
}
