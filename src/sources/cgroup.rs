// ============================================================================
// CONTAINER SOURCES (CGROUP V1 / V2)
// ============================================================================
// Reads CPU limits, throttling, OOM events and CPU usage of the enclosing
// cgroup. The layout is detected once per source from the cgroup root.
// ============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::system::CpuSnapshot;
use super::{read_file, read_int, Source, SourceContext, NS_CONTAINER, NS_SYSTEM};
use crate::delta::counter_delta;
use crate::error::{SourceError, SourceResult};
use crate::logging::SourceLogger;
use crate::model::{NamedMetric, StatsEntity};

/// Kernel USER_HZ, the unit of /proc/stat and cpuacct.stat.
static CLOCK_TICKS: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
});

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

// ----------------------------------------------------------------------------
// 9.1 Cgroup Layout
// ----------------------------------------------------------------------------

/// Cgroup hierarchy flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// Legacy per-controller hierarchies
    V1,
    /// Unified hierarchy
    V2,
}

impl CgroupVersion {
    /// v2 when the root carries `cgroup.controllers`, otherwise v1.
    pub fn detect(root: &Path) -> Self {
        if root.join("cgroup.controllers").exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }
}

/// Counts CPUs in a cpuset list such as `0-3,8,10-11`, ranges inclusive.
pub fn parse_cpuset(list: &str) -> SourceResult<u64> {
    let list = list.trim();
    if list.is_empty() {
        return Ok(0);
    }

    let bad = |part: &str| SourceError::parse("cpuset", format!("invalid cpu list entry {:?}", part));
    list.split(',').try_fold(0u64, |count, part| {
        let part = part.trim();
        let span = match part.split_once('-') {
            Some((start, end)) => {
                let start: u64 = start.trim().parse().map_err(|_| bad(part))?;
                let end: u64 = end.trim().parse().map_err(|_| bad(part))?;
                if end < start {
                    return Err(bad(part));
                }
                end - start + 1
            }
            None => {
                part.parse::<u64>().map_err(|_| bad(part))?;
                1
            }
        };
        Ok(count + span)
    })
}

/// `key value` lines, as in cpu.stat or memory.events.
pub(crate) fn parse_flat_keyed(content: &str) -> BTreeMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(char::is_whitespace)?;
            Some((key.to_string(), value.trim().parse().ok()?))
        })
        .collect()
}

/// CPUs visible to the host, from the per-core lines of /proc/stat.
async fn host_cores(proc_root: &Path) -> f64 {
    let counted = read_file(&proc_root.join("stat"))
        .await
        .map(|stat| {
            stat.lines()
                .filter(|l| l.starts_with("cpu") && l.as_bytes().get(3).is_some_and(u8::is_ascii_digit))
                .count()
        })
        .unwrap_or(0);
    if counted > 0 {
        counted as f64
    } else {
        std::thread::available_parallelism().map_or(1.0, |n| n.get() as f64)
    }
}

// ----------------------------------------------------------------------------
// 9.2 Container CPU Limits & Throttling
// ----------------------------------------------------------------------------

/// `container.cpu.*`: cores, quota and period, shares, cpuset size and
/// throttling counters.
pub struct ContainerCpu {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
    logger: SourceLogger,
}

#[derive(Debug, Default, PartialEq)]
struct CpuLimits {
    cores: f64,
    period: f64,
    quota: f64,
    shares: f64,
    set_cores: f64,
    throttled_time: f64,
    throttled: f64,
    periods: f64,
}

impl ContainerCpu {
    pub fn new(cgroup_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
            logger: SourceLogger::new("container_cpu"),
        }
    }

    async fn read_v2(&self, host_cores: f64) -> SourceResult<CpuLimits> {
        let root = &self.cgroup_root;

        let max_path = root.join("cpu.max");
        let max = read_file(&max_path).await?;
        let mut fields = max.split_whitespace();
        let quota_raw = fields.next().unwrap_or("max");
        let period: f64 = fields
            .next()
            .unwrap_or("100000")
            .parse()
            .map_err(|e| SourceError::parse(max_path.display().to_string(), e))?;
        let (quota, cores) = if quota_raw == "max" {
            (-1.0, host_cores)
        } else {
            let quota: f64 = quota_raw
                .parse()
                .map_err(|e| SourceError::parse(max_path.display().to_string(), e))?;
            (quota, if period > 0.0 { quota / period } else { host_cores })
        };

        let weight = read_int(&root.join("cpu.weight")).await?;
        let shares = 2 + ((weight - 1) * 262_142) / 9_999;

        let cpuset = read_file(&root.join("cpuset.cpus.effective")).await?;
        let stat = parse_flat_keyed(&read_file(&root.join("cpu.stat")).await?);

        Ok(CpuLimits {
            cores,
            period,
            quota,
            shares: shares as f64,
            set_cores: parse_cpuset(&cpuset)? as f64,
            throttled_time: stat.get("throttled_usec").copied().unwrap_or(0) as f64,
            throttled: stat.get("nr_throttled").copied().unwrap_or(0) as f64,
            periods: stat.get("nr_periods").copied().unwrap_or(0) as f64,
        })
    }

    async fn read_v1(&self, host_cores: f64) -> SourceResult<CpuLimits> {
        let root = &self.cgroup_root;

        let period = read_int(&root.join("cpu/cpu.cfs_period_us")).await? as f64;
        let quota = read_int(&root.join("cpu/cpu.cfs_quota_us")).await? as f64;
        let cores = if quota < 0.0 || period <= 0.0 {
            host_cores
        } else {
            quota / period
        };

        let shares = read_int(&root.join("cpu/cpu.shares")).await? as f64;
        let cpuset = read_file(&root.join("cpuset/cpuset.cpus")).await?;
        let stat = parse_flat_keyed(&read_file(&root.join("cpu/cpu.stat")).await?);

        Ok(CpuLimits {
            cores,
            period,
            quota,
            shares,
            set_cores: parse_cpuset(&cpuset)? as f64,
            // v1 reports nanoseconds, v2 microseconds
            throttled_time: stat.get("throttled_time").copied().unwrap_or(0) as f64 / 1000.0,
            throttled: stat.get("nr_throttled").copied().unwrap_or(0) as f64,
            periods: stat.get("nr_periods").copied().unwrap_or(0) as f64,
        })
    }

    async fn read_limits(&self) -> SourceResult<CpuLimits> {
        let host_cores = host_cores(&self.proc_root).await;
        let mut limits = match CgroupVersion::detect(&self.cgroup_root) {
            CgroupVersion::V2 => self.read_v2(host_cores).await?,
            CgroupVersion::V1 => self.read_v1(host_cores).await?,
        };
        if limits.set_cores == 0.0 {
            limits.set_cores = limits.cores;
        }
        Ok(limits)
    }
}

#[async_trait]
impl Source for ContainerCpu {
    fn name(&self) -> &'static str {
        "container_cpu"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let limits = match self.read_limits().await {
            Ok(limits) => {
                self.logger.reset();
                limits
            }
            Err(e) => {
                self.logger.log(&format!("Failed to read container cpu limits: {}", e));
                return Err(e);
            }
        };

        let throttling_percent = if limits.periods > 0.0 {
            limits.throttled / limits.periods * 100.0
        } else {
            0.0
        };

        let metrics = NamedMetric::new(NS_CONTAINER, "cpu").convert([
            ("cores", limits.cores),
            ("period", limits.period),
            ("quota", limits.quota),
            ("shares", limits.shares),
            ("set.cores", limits.set_cores),
            ("throttling.time", limits.throttled_time),
            ("throttling.throttled", limits.throttled),
            ("throttling.periods", limits.periods),
            ("throttling.percent", throttling_percent),
        ]);
        ctx.send(StatsEntity::new(Vec::new(), metrics)).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 9.3 Container Memory Events
// ----------------------------------------------------------------------------

/// `container.mem.{oom,oom.kill}`.
pub struct ContainerMem {
    cgroup_root: PathBuf,
    logger: SourceLogger,
}

impl ContainerMem {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            logger: SourceLogger::new("container_mem"),
        }
    }

    async fn read_events(&self) -> SourceResult<(f64, f64)> {
        let (path, oom_key) = match CgroupVersion::detect(&self.cgroup_root) {
            CgroupVersion::V2 => (self.cgroup_root.join("memory.events"), "oom"),
            CgroupVersion::V1 => (self.cgroup_root.join("memory/memory.oom_control"), "under_oom"),
        };
        let events = parse_flat_keyed(&read_file(&path).await?);
        let get = |key: &str| events.get(key).copied().unwrap_or(0) as f64;
        Ok((get(oom_key), get("oom_kill")))
    }
}

#[async_trait]
impl Source for ContainerMem {
    fn name(&self) -> &'static str {
        "container_mem"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let (oom, oom_kill) = match self.read_events().await {
            Ok(events) => {
                self.logger.reset();
                events
            }
            Err(e) => {
                self.logger.log(&format!("Failed to read container memory events: {}", e));
                return Err(e);
            }
        };

        let metrics = NamedMetric::new(NS_CONTAINER, "mem").convert([("oom", oom), ("oom.kill", oom_kill)]);
        ctx.send(StatsEntity::new(Vec::new(), metrics)).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 9.4 Cgroup-Aware CPU Usage
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuUsage {
    user_ns: f64,
    system_ns: f64,
    host_ns: f64,
}

/// Container CPU usage as `system.cpu.{user,system}`: cgroup usage deltas
/// over host CPU time deltas, scaled to the host core count.
pub struct CgroupCpu {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
    prev: Mutex<Option<CpuUsage>>,
}

impl CgroupCpu {
    pub fn new(cgroup_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
            prev: Mutex::new(None),
        }
    }

    async fn read_usage(&self) -> SourceResult<CpuUsage> {
        let ticks = *CLOCK_TICKS as f64;
        let (user_ns, system_ns) = match CgroupVersion::detect(&self.cgroup_root) {
            CgroupVersion::V2 => {
                let stat = parse_flat_keyed(&read_file(&self.cgroup_root.join("cpu.stat")).await?);
                let usec = |key: &str| stat.get(key).copied().unwrap_or(0) as f64 * 1000.0;
                (usec("user_usec"), usec("system_usec"))
            }
            CgroupVersion::V1 => {
                let path = self.cgroup_root.join("cpuacct/cpuacct.stat");
                let stat = parse_flat_keyed(&read_file(&path).await?);
                let jiffies = |key: &str| stat.get(key).copied().unwrap_or(0) as f64 * NANOS_PER_SEC / ticks;
                (jiffies("user"), jiffies("system"))
            }
        };

        let stat_path = self.proc_root.join("stat");
        let host = CpuSnapshot::from_proc_stat(&read_file(&stat_path).await?)
            .ok_or_else(|| SourceError::parse(stat_path.display().to_string(), "missing cpu line"))?;
        // user nice system idle iowait irq softirq
        let host_ticks = host.total() - host.steal;

        Ok(CpuUsage {
            user_ns,
            system_ns,
            host_ns: host_ticks as f64 * NANOS_PER_SEC / ticks,
        })
    }
}

#[async_trait]
impl Source for CgroupCpu {
    fn name(&self) -> &'static str {
        "cgroup_cpu"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let current = self.read_usage().await?;
        let cores = host_cores(&self.proc_root).await;

        let Some(prev) = self.prev.lock().replace(current) else {
            return Ok(());
        };

        let host_delta = counter_delta(current.host_ns, prev.host_ns);
        let pct = |cur: f64, before: f64| {
            if host_delta <= 0.0 {
                0.0
            } else {
                counter_delta(cur, before) / host_delta * cores * 100.0
            }
        };

        let metrics = NamedMetric::new(NS_SYSTEM, "cpu").convert([
            ("user", pct(current.user_ns, prev.user_ns)),
            ("system", pct(current.system_ns, prev.system_ns)),
        ]);
        ctx.send(StatsEntity::new(Vec::new(), metrics)).await;
        Ok(())
    }
}

/// All container sources for one cgroup root.
pub fn container_sources(cgroup_root: &Path, proc_root: &Path) -> Vec<Arc<dyn Source>> {
    vec![
        Arc::new(ContainerCpu::new(cgroup_root, proc_root)),
        Arc::new(ContainerMem::new(cgroup_root)),
        Arc::new(CgroupCpu::new(cgroup_root, proc_root)),
    ]
}
