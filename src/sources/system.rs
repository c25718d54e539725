// ============================================================================
// SYSTEM SOURCES
// ============================================================================
// Host-level sources reading directly from procfs under a configurable root:
// CPU, memory, swap, load, disk usage, disk io and network io. Rate metrics
// keep the previous snapshot and apply the counter delta rule per field.
// ============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::Disks;
use tracing::debug;

use super::{read_file, Source, SourceContext, NS_SYSTEM};
use crate::delta::{counter_delta, counter_delta_from};
use crate::error::{SourceError, SourceResult};
use crate::model::{Dimension, NamedMetric, SimpleMetric, StatsEntity};

pub const DIM_MOUNT_POINT: &str = "mount_point";
pub const DIM_FILE_PATH: &str = "file_path";
pub const DIM_NETWORK_INTERFACE: &str = "network_interface";

// ----------------------------------------------------------------------------
// 8.1 CPU Snapshot
// ----------------------------------------------------------------------------

/// Aggregate CPU counters from the `cpu` line of /proc/stat, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CpuSnapshot {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuSnapshot {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Parse the aggregate `cpu` line. Per-core lines are rejected.
    /// Format: "cpu  12345 678 9012 34567 890 12 34 56 0 0"
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "cpu" {
            return None;
        }

        let mut next = || parts.next().and_then(|s| s.parse::<u64>().ok());
        let user = next()?;
        let nice = next()?;
        let system = next()?;
        let idle = next()?;
        Some(Self {
            user,
            nice,
            system,
            idle,
            iowait: next().unwrap_or(0),
            irq: next().unwrap_or(0),
            softirq: next().unwrap_or(0),
            steal: next().unwrap_or(0),
        })
    }

    pub fn from_proc_stat(content: &str) -> Option<Self> {
        content.lines().find_map(Self::parse)
    }

    /// Percentages of the interval between `prev` and `self`.
    fn percentages(&self, prev: &CpuSnapshot) -> [(&'static str, f64); 5] {
        let total = counter_delta(self.total(), prev.total());
        let pct = |cur: u64, before: u64| {
            if total == 0 {
                0.0
            } else {
                counter_delta(cur, before) as f64 / total as f64 * 100.0
            }
        };
        [
            ("user", pct(self.user + self.nice, prev.user + prev.nice)),
            ("system", pct(self.system + self.irq + self.softirq, prev.system + prev.irq + prev.softirq)),
            ("idle", pct(self.idle, prev.idle)),
            ("iowait", pct(self.iowait, prev.iowait)),
            ("stolen", pct(self.steal, prev.steal)),
        ]
    }
}

/// `system.cpu.{user,system,idle,iowait,stolen}` over the tick.
pub struct SystemCpu {
    proc_root: PathBuf,
    prev: Mutex<Option<CpuSnapshot>>,
}

impl SystemCpu {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            prev: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for SystemCpu {
    fn name(&self) -> &'static str {
        "system_cpu"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let path = self.proc_root.join("stat");
        let content = read_file(&path).await?;
        let current = CpuSnapshot::from_proc_stat(&content)
            .ok_or_else(|| SourceError::parse(path.display().to_string(), "missing cpu line"))?;

        // First tick only primes the snapshot
        let Some(prev) = self.prev.lock().replace(current) else {
            return Ok(());
        };

        let metrics = NamedMetric::new(NS_SYSTEM, "cpu").convert(current.percentages(&prev));
        ctx.send(StatsEntity::new(Vec::new(), metrics)).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 8.2 Memory & Swap
// ----------------------------------------------------------------------------

/// /proc/meminfo as bytes, keyed by field name.
pub(crate) fn parse_meminfo(content: &str) -> BTreeMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, ':');
            let key = parts.next()?.trim();
            let rest = parts.next()?.trim();
            let mut fields = rest.split_whitespace();
            let value: u64 = fields.next()?.parse().ok()?;
            let bytes = match fields.next() {
                Some("kB") => value * 1024,
                _ => value,
            };
            Some((key.to_string(), bytes))
        })
        .collect()
}

fn pct(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

fn memory_metrics(info: &BTreeMap<String, u64>) -> Vec<SimpleMetric> {
    let get = |key: &str| info.get(key).copied().unwrap_or(0) as f64;
    let total = get("MemTotal");
    let free = get("MemFree");
    let buffered = get("Buffers");
    let cached = get("Cached") + get("SReclaimable");
    let available = match info.get("MemAvailable") {
        Some(v) => *v as f64,
        None => free + buffered + cached,
    };
    let used = (total - available).max(0.0);

    NamedMetric::new(NS_SYSTEM, "mem").convert([
        ("total", total),
        ("free", free),
        ("available", available),
        ("buffered", buffered),
        ("cached", cached),
        ("shared", get("Shmem")),
        ("used", used),
        ("used.all", (total - free).max(0.0)),
        ("pct_used", pct(used, total)),
    ])
}

fn swap_metrics(info: &BTreeMap<String, u64>) -> Vec<SimpleMetric> {
    let get = |key: &str| info.get(key).copied().unwrap_or(0) as f64;
    let total = get("SwapTotal");
    let free = get("SwapFree");

    NamedMetric::new(NS_SYSTEM, "swap").convert([
        ("total", total),
        ("free", free),
        ("used", (total - free).max(0.0)),
        ("pct_free", pct(free, total)),
    ])
}

/// `system.mem.*` from /proc/meminfo.
pub struct SystemMemory {
    proc_root: PathBuf,
}

impl SystemMemory {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

#[async_trait]
impl Source for SystemMemory {
    fn name(&self) -> &'static str {
        "system_memory"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let info = parse_meminfo(&read_file(&self.proc_root.join("meminfo")).await?);
        ctx.send(StatsEntity::new(Vec::new(), memory_metrics(&info))).await;
        Ok(())
    }
}

/// `system.swap.*` from /proc/meminfo.
pub struct SystemSwap {
    proc_root: PathBuf,
}

impl SystemSwap {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

#[async_trait]
impl Source for SystemSwap {
    fn name(&self) -> &'static str {
        "system_swap"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let info = parse_meminfo(&read_file(&self.proc_root.join("meminfo")).await?);
        ctx.send(StatsEntity::new(Vec::new(), swap_metrics(&info))).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 8.3 Load Average
// ----------------------------------------------------------------------------

fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut parts = content.split_whitespace().map(|s| s.parse::<f64>().ok());
    Some([parts.next()??, parts.next()??, parts.next()??])
}

/// `system.load.{1,5,15}`.
pub struct SystemLoad {
    proc_root: PathBuf,
}

impl SystemLoad {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

#[async_trait]
impl Source for SystemLoad {
    fn name(&self) -> &'static str {
        "system_load"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let path = self.proc_root.join("loadavg");
        let [one, five, fifteen] = parse_loadavg(&read_file(&path).await?)
            .ok_or_else(|| SourceError::parse(path.display().to_string(), "malformed loadavg"))?;

        let metrics = NamedMetric::new(NS_SYSTEM, "load").convert([("1", one), ("5", five), ("15", fifteen)]);
        ctx.send(StatsEntity::new(Vec::new(), metrics)).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 8.4 Disk Usage
// ----------------------------------------------------------------------------

/// `system.disk.*` per mount point, from sysinfo's disk list.
#[derive(Debug, Default)]
pub struct SystemDisk;

impl SystemDisk {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Source for SystemDisk {
    fn name(&self) -> &'static str {
        "system_disk"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let entities = tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|disk| disk.total_space() > 0)
                .map(|disk| {
                    let total = disk.total_space() as f64;
                    let free = disk.available_space() as f64;
                    let used = (total - free).max(0.0);
                    StatsEntity::new(
                        vec![Dimension::new(
                            DIM_MOUNT_POINT,
                            disk.mount_point().to_string_lossy(),
                        )],
                        NamedMetric::new(NS_SYSTEM, "disk").convert([
                            ("total", total),
                            ("used", used),
                            ("free", free),
                            ("in_use", pct(used, total)),
                        ]),
                    )
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SourceError::Unsupported {
            message: format!("disk enumeration failed: {}", e),
        })?;

        ctx.send_all(entities).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 8.5 Disk IO
// ----------------------------------------------------------------------------

/// One /proc/diskstats row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DiskSnapshot {
    pub device: String,
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub read_time_ms: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
    pub write_time_ms: u64,
}

impl DiskSnapshot {
    const SECTOR_SIZE: u64 = 512;

    /// Format: "   8       0 sda 12345 678 901234 5678 ..."
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            return None;
        }

        let device = parts[2];
        if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("dm-") {
            return None;
        }

        let field = |i: usize| parts[i].parse::<u64>().unwrap_or(0);
        Some(Self {
            device: device.to_string(),
            reads_completed: field(3),
            sectors_read: field(5),
            read_time_ms: field(6),
            writes_completed: field(7),
            sectors_written: field(9),
            write_time_ms: field(10),
        })
    }

    /// Whole disks are like sda, nvme0n1, vda; partitions like sda1, nvme0n1p1.
    pub fn is_whole_disk(&self) -> bool {
        let name = self.device.as_str();
        if name.starts_with("nvme") || name.starts_with("mmcblk") {
            match name.rfind('p') {
                Some(p) => !name[p + 1..].chars().all(|c| c.is_ascii_digit()) || p + 1 == name.len(),
                None => true,
            }
        } else {
            !name.ends_with(|c: char| c.is_ascii_digit())
        }
    }

    fn delta_metrics(&self, prev: Option<&DiskSnapshot>) -> Vec<SimpleMetric> {
        let d = |cur: u64, before: Option<u64>| counter_delta_from(cur, before) as f64;
        let kb = |sectors: f64| sectors * Self::SECTOR_SIZE as f64 / 1024.0;

        NamedMetric::new(NS_SYSTEM, "io").convert([
            ("iops_r", d(self.reads_completed, prev.map(|p| p.reads_completed))),
            ("iops_w", d(self.writes_completed, prev.map(|p| p.writes_completed))),
            ("kbs_r", kb(d(self.sectors_read, prev.map(|p| p.sectors_read)))),
            ("kbs_w", kb(d(self.sectors_written, prev.map(|p| p.sectors_written)))),
            ("wait_r", d(self.read_time_ms, prev.map(|p| p.read_time_ms))),
            ("wait_w", d(self.write_time_ms, prev.map(|p| p.write_time_ms))),
        ])
    }
}

/// `system.io.*` per whole disk, as deltas over the tick.
pub struct SystemDiskIo {
    proc_root: PathBuf,
    prev: Mutex<Option<BTreeMap<String, DiskSnapshot>>>,
}

impl SystemDiskIo {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            prev: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for SystemDiskIo {
    fn name(&self) -> &'static str {
        "system_disk_io"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let content = read_file(&self.proc_root.join("diskstats")).await?;
        let current: BTreeMap<String, DiskSnapshot> = content
            .lines()
            .filter_map(DiskSnapshot::parse)
            .filter(DiskSnapshot::is_whole_disk)
            .map(|snap| (snap.device.clone(), snap))
            .collect();

        let entities: Vec<_> = {
            let mut prev = self.prev.lock();
            // First poll is its own previous
            let baseline = prev.take().unwrap_or_else(|| current.clone());
            let entities = current
                .values()
                .map(|snap| {
                    StatsEntity::new(
                        vec![Dimension::new(DIM_FILE_PATH, format!("/dev/{}", snap.device))],
                        snap.delta_metrics(baseline.get(&snap.device)),
                    )
                })
                .collect();
            *prev = Some(current);
            entities
        };

        ctx.send_all(entities).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 8.6 Network IO
// ----------------------------------------------------------------------------

/// One /proc/net/dev row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NetIfSnapshot {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_drops: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_drops: u64,
}

impl NetIfSnapshot {
    /// Format: "  eth0: 12345 678 9 0 0 0 0 0 12345 678 9 0 0 0 0 0"
    pub fn parse(line: &str) -> Option<(String, Self)> {
        let (name, rest) = line.trim().split_once(':')?;
        let name = name.trim();
        if name == "lo" {
            return None;
        }

        let values: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        if values.len() < 16 {
            return None;
        }

        Some((
            name.to_string(),
            Self {
                rx_bytes: values[0],
                rx_packets: values[1],
                rx_errors: values[2],
                rx_drops: values[3],
                tx_bytes: values[8],
                tx_packets: values[9],
                tx_errors: values[10],
                tx_drops: values[11],
            },
        ))
    }

    fn delta(&self, prev: Option<&NetIfSnapshot>) -> Self {
        let d = |cur: u64, f: fn(&NetIfSnapshot) -> u64| counter_delta_from(cur, prev.map(f));
        Self {
            rx_bytes: d(self.rx_bytes, |p| p.rx_bytes),
            rx_packets: d(self.rx_packets, |p| p.rx_packets),
            rx_errors: d(self.rx_errors, |p| p.rx_errors),
            rx_drops: d(self.rx_drops, |p| p.rx_drops),
            tx_bytes: d(self.tx_bytes, |p| p.tx_bytes),
            tx_packets: d(self.tx_packets, |p| p.tx_packets),
            tx_errors: d(self.tx_errors, |p| p.tx_errors),
            tx_drops: d(self.tx_drops, |p| p.tx_drops),
        }
    }

    fn add(&mut self, other: &NetIfSnapshot) {
        self.rx_bytes += other.rx_bytes;
        self.rx_packets += other.rx_packets;
        self.rx_errors += other.rx_errors;
        self.rx_drops += other.rx_drops;
        self.tx_bytes += other.tx_bytes;
        self.tx_packets += other.tx_packets;
        self.tx_errors += other.tx_errors;
        self.tx_drops += other.tx_drops;
    }

    fn metrics(&self) -> Vec<SimpleMetric> {
        NamedMetric::new(NS_SYSTEM, "net").convert([
            ("bytes_sent", self.tx_bytes as f64),
            ("bytes_rcvd", self.rx_bytes as f64),
            ("packets_in.count", self.rx_packets as f64),
            ("packets_out.count", self.tx_packets as f64),
            ("packets_in.error", self.rx_errors as f64),
            ("packets_out.error", self.tx_errors as f64),
            ("drops_in.count", self.rx_drops as f64),
            ("drops_out.count", self.tx_drops as f64),
        ])
    }
}

/// `TcpExt: ListenOverflows` from /proc/net/netstat, a header line followed
/// by a value line per protocol.
pub(crate) fn parse_listen_overflows(content: &str) -> Option<u64> {
    let mut lines = content.lines();
    while let Some(header) = lines.next() {
        let values = lines.next()?;
        if !header.starts_with("TcpExt:") {
            continue;
        }
        let index = header.split_whitespace().position(|k| k == "ListenOverflows")?;
        return values.split_whitespace().nth(index)?.parse().ok();
    }
    None
}

#[derive(Debug, Default)]
struct NetState {
    interfaces: BTreeMap<String, NetIfSnapshot>,
    listen_overflows: Option<u64>,
}

/// `system.net.*` per up, non-loopback interface plus a host total.
pub struct SystemNetIo {
    proc_root: PathBuf,
    sys_root: PathBuf,
    prev: Mutex<Option<NetState>>,
}

impl SystemNetIo {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        let proc_root = proc_root.into();
        let sys_root = proc_root
            .parent()
            .map(|p| p.join("sys"))
            .unwrap_or_else(|| PathBuf::from("/sys"));
        Self {
            proc_root,
            sys_root,
            prev: Mutex::new(None),
        }
    }

    /// An interface whose operstate cannot be read is treated as up.
    async fn is_up(&self, interface: &str) -> bool {
        let path = self.sys_root.join("class/net").join(interface).join("operstate");
        match tokio::fs::read_to_string(&path).await {
            Ok(state) => !matches!(state.trim(), "down" | "notpresent" | "lowerlayerdown"),
            Err(_) => true,
        }
    }

    async fn read_state(&self) -> SourceResult<NetState> {
        let content = read_file(&self.proc_root.join("net/dev")).await?;
        let mut interfaces = BTreeMap::new();
        for (name, snap) in content.lines().filter_map(NetIfSnapshot::parse) {
            if self.is_up(&name).await {
                interfaces.insert(name, snap);
            }
        }

        let listen_overflows = match read_file(&self.proc_root.join("net/netstat")).await {
            Ok(netstat) => parse_listen_overflows(&netstat),
            Err(e) => {
                debug!(target: "nginx_telemetry::source::system", error = %e, "netstat unavailable");
                None
            }
        };

        Ok(NetState {
            interfaces,
            listen_overflows,
        })
    }
}

#[async_trait]
impl Source for SystemNetIo {
    fn name(&self) -> &'static str {
        "system_net_io"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let current = self.read_state().await?;

        let entities = {
            let mut guard = self.prev.lock();
            let prev = guard.take();
            let baseline = prev.as_ref().unwrap_or(&current);

            let mut total = NetIfSnapshot::default();
            let mut entities: Vec<StatsEntity> = current
                .interfaces
                .iter()
                .map(|(name, snap)| {
                    let delta = snap.delta(baseline.interfaces.get(name));
                    total.add(&delta);
                    StatsEntity::new(
                        vec![Dimension::new(DIM_NETWORK_INTERFACE, name)],
                        delta.metrics(),
                    )
                })
                .collect();

            let mut total_metrics = total.metrics();
            if let Some(overflows) = current.listen_overflows {
                let delta = counter_delta_from(overflows, baseline.listen_overflows);
                total_metrics.push(SimpleMetric::new(
                    NamedMetric::new(NS_SYSTEM, "net").label("listen_overflows"),
                    delta as f64,
                ));
            }
            entities.push(StatsEntity::new(Vec::new(), total_metrics));

            *guard = Some(current);
            entities
        };

        ctx.send_all(entities).await;
        Ok(())
    }
}

/// All host sources reading under `proc_root`.
pub fn system_sources(proc_root: &Path) -> Vec<Arc<dyn Source>> {
    vec![
        Arc::new(SystemCpu::new(proc_root)),
        Arc::new(SystemMemory::new(proc_root)),
        Arc::new(SystemSwap::new(proc_root)),
        Arc::new(SystemLoad::new(proc_root)),
        Arc::new(SystemDisk::new()),
        Arc::new(SystemDiskIo::new(proc_root)),
        Arc::new(SystemNetIo::new(proc_root)),
    ]
}
