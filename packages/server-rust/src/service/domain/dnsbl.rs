//! Datacenter range loader.
//!
//! Loading happens in the background after `init` returns; nothing waits on
//! it except callers of `wait_loaded`. A missing or unreadable file leaves
//! the table empty and is only logged.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::names;
use crate::service::registry::{ManagedService, ServiceContext};

/// Inclusive IPv4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    pub start: u32,
    pub end: u32,
}

impl IpRange {
    /// Parses a `start,end[,name...]` line. Returns `None` for anything else.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split(',').map(str::trim);
        let start: Ipv4Addr = fields.next()?.parse().ok()?;
        let end: Ipv4Addr = fields.next()?.parse().ok()?;
        let (start, end) = (u32::from(start), u32::from(end));
        (start <= end).then_some(Self { start, end })
    }

    #[must_use]
    pub fn contains(&self, ip: u32) -> bool {
        (self.start..=self.end).contains(&ip)
    }
}

/// Parses a range file. Blank lines and `#` comments are skipped; malformed
/// lines are counted. Returns sorted ranges and the malformed count.
#[must_use]
pub fn parse_ranges(source: &str) -> (Vec<IpRange>, usize) {
    let mut ranges = Vec::new();
    let mut malformed = 0;
    for line in source.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match IpRange::parse_line(line) {
            Some(range) => ranges.push(range),
            None => malformed += 1,
        }
    }
    ranges.sort_unstable();
    (ranges, malformed)
}

#[derive(Debug)]
pub struct DnsblService {
    ranges: Arc<ArcSwap<Vec<IpRange>>>,
    loaded: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DnsblService {
    fn default() -> Self {
        let (loaded, _) = watch::channel(false);
        Self {
            ranges: Arc::default(),
            loaded: Arc::new(loaded),
            task: Mutex::new(None),
        }
    }
}

impl DnsblService {
    /// Whether `ip` falls in a known datacenter range. Always `false` for
    /// IPv6 and before loading finishes.
    #[must_use]
    pub fn is_datacenter(&self, ip: IpAddr) -> bool {
        let IpAddr::V4(v4) = ip else {
            return false;
        };
        let ip = u32::from(v4);
        let ranges = self.ranges.load();
        // Ranges are sorted by start; check every range starting at or before ip.
        let upper = ranges.partition_point(|r| r.start <= ip);
        ranges[..upper].iter().rev().any(|r| r.contains(ip))
    }

    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges.load().len()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolves once the background load has finished, successfully or not.
    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }
}

async fn load(path: Option<PathBuf>, ranges: Arc<ArcSwap<Vec<IpRange>>>, loaded: Arc<watch::Sender<bool>>) {
    if let Some(path) = path {
        match read_ranges(&path).await {
            Ok((parsed, malformed)) => {
                if malformed > 0 {
                    warn!(path = %path.display(), malformed, "skipped malformed datacenter lines");
                }
                info!(ranges = parsed.len(), "datacenter ranges loaded");
                ranges.store(Arc::new(parsed));
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not load datacenter ranges");
            }
        }
    } else {
        debug!("no datacenter file configured");
    }
    loaded.send_replace(true);
}

async fn read_ranges(path: &Path) -> std::io::Result<(Vec<IpRange>, usize)> {
    let source = tokio::fs::read_to_string(path).await?;
    Ok(parse_ranges(&source))
}

#[async_trait]
impl ManagedService for DnsblService {
    fn name(&self) -> &'static str {
        names::DNSBL
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let path = ctx.config.current().datacenters.clone();
        let ranges = Arc::clone(&self.ranges);
        let loaded = Arc::clone(&self.loaded);
        let handle = ctx.faults.spawn_supervised("dnsbl-load", async move {
            load(path, ranges, loaded).await;
            Ok(())
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
