// ============================================================================
// SAMPLE / ENTITY MODEL
// ============================================================================
// The shared vocabulary every source produces and every consumer reads:
// dimensions, simple metrics, stats entities and the common dimension set
// attached to everything collected for one subject.
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{GeneralConfig, NginxCollectorConfig};

// ----------------------------------------------------------------------------
// 2.1 Dimension Names
// ----------------------------------------------------------------------------

pub const DIM_SYSTEM_ID: &str = "system_id";
pub const DIM_HOSTNAME: &str = "hostname";
pub const DIM_INSTANCE_TAGS: &str = "instance_tags";
pub const DIM_INSTANCE_GROUP: &str = "instance_group";
pub const DIM_DISPLAY_NAME: &str = "display_name";
pub const DIM_NGINX_ID: &str = "nginx_id";
pub const DIM_PUBLISHED_API: &str = "system.published_api";
pub const DIM_NGINX_TYPE: &str = "nginx.type";
pub const DIM_NGINX_BUILD: &str = "nginx.build";
pub const DIM_NGINX_VERSION: &str = "nginx.version";
pub const DIM_NGINX_CONF_PATH: &str = "nginx.conf_path";
pub const DIM_NGINX_ACCESS_LOGS: &str = "nginx.access_log_paths";

// ----------------------------------------------------------------------------
// 2.2 Dimension & Metric
// ----------------------------------------------------------------------------

/// A single name/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A named float sample. Names are dot-delimited `namespace.group.leaf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMetric {
    pub name: String,
    pub value: f64,
}

impl SimpleMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Builds metric names from a namespace and optional group.
///
/// Empty parts are skipped, so `("nginx", "", "status")` yields `nginx.status`.
#[derive(Debug, Clone, Copy)]
pub struct NamedMetric<'a> {
    pub namespace: &'a str,
    pub group: &'a str,
}

impl<'a> NamedMetric<'a> {
    pub const fn new(namespace: &'a str, group: &'a str) -> Self {
        Self { namespace, group }
    }

    pub fn label(&self, name: &str) -> String {
        [self.namespace, self.group, name]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn convert<'s, I>(&self, samples: I) -> Vec<SimpleMetric>
    where
        I: IntoIterator<Item = (&'s str, f64)>,
    {
        samples
            .into_iter()
            .map(|(name, value)| SimpleMetric::new(self.label(name), value))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 2.3 Stats Entity
// ----------------------------------------------------------------------------

/// Per-entity corrections to the common dimensions.
///
/// Sources that learn context while collecting (the Plus API reports the
/// nginx build, an access log knows its own path) attach it here instead of
/// writing into the collector's shared dimension state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimOverrides {
    pub published_api: Option<String>,
    pub nginx_type: Option<String>,
    pub nginx_build: Option<String>,
    pub nginx_version: Option<String>,
}

impl DimOverrides {
    pub fn published_api(mut self, api: impl Into<String>) -> Self {
        self.published_api = Some(api.into());
        self
    }

    pub fn nginx_type(mut self, nginx_type: impl Into<String>) -> Self {
        self.nginx_type = Some(nginx_type.into());
        self
    }

    pub fn build(mut self, build: impl Into<String>, version: impl Into<String>) -> Self {
        self.nginx_build = Some(build.into());
        self.nginx_version = Some(version.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One timestamped, dimensioned bundle of metrics emitted by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntity {
    pub timestamp: DateTime<Utc>,
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<SimpleMetric>,
    #[serde(skip)]
    pub overrides: DimOverrides,
}

impl StatsEntity {
    pub fn new(dimensions: Vec<Dimension>, metrics: Vec<SimpleMetric>) -> Self {
        Self {
            timestamp: Utc::now(),
            dimensions,
            metrics,
            overrides: DimOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: DimOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Prefix the entity's own dimensions with the common set, applying any
    /// per-entity overrides first.
    pub fn tagged(self, common: &CommonDim) -> Self {
        let mut dimensions = if self.overrides.is_empty() {
            common.to_dimensions()
        } else {
            common.with_overrides(&self.overrides).to_dimensions()
        };
        dimensions.extend(self.dimensions);
        Self {
            timestamp: self.timestamp,
            dimensions,
            metrics: self.metrics,
            overrides: DimOverrides::default(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }
}

// ----------------------------------------------------------------------------
// 2.4 Common Dimensions
// ----------------------------------------------------------------------------

/// Identity and context dimensions shared by everything one collector emits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonDim {
    pub system_id: String,
    pub hostname: String,
    pub instance_tags: String,
    pub instance_group: String,
    pub display_name: String,
    pub nginx_id: String,
    pub published_api: String,
    pub nginx_type: String,
    pub nginx_build: String,
    pub nginx_version: String,
    pub nginx_conf_path: String,
    pub nginx_access_logs: String,
}

impl CommonDim {
    /// Dimensions for host-level collectors.
    pub fn from_agent(agent: &GeneralConfig) -> Self {
        Self {
            system_id: agent.system_id.clone(),
            hostname: agent.hostname.clone(),
            instance_tags: agent.tags.join(","),
            instance_group: agent.instance_group.clone(),
            display_name: agent.display_name.clone(),
            ..Self::default()
        }
    }

    /// Dimensions for one nginx instance.
    pub fn for_nginx(agent: &GeneralConfig, nginx: &NginxCollectorConfig) -> Self {
        Self {
            nginx_id: nginx.nginx_id.clone(),
            nginx_conf_path: nginx.conf_path.clone(),
            nginx_access_logs: nginx
                .access_logs
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            ..Self::from_agent(agent)
        }
    }

    pub fn with_overrides(&self, overrides: &DimOverrides) -> Self {
        let mut dims = self.clone();
        if let Some(api) = &overrides.published_api {
            dims.published_api = api.clone();
        }
        if let Some(nginx_type) = &overrides.nginx_type {
            dims.nginx_type = nginx_type.clone();
        }
        if let Some(build) = &overrides.nginx_build {
            dims.nginx_build = build.clone();
        }
        if let Some(version) = &overrides.nginx_version {
            dims.nginx_version = version.clone();
        }
        dims
    }

    /// Emit the dimensions in their fixed order. The nginx block is only
    /// present for nginx subjects.
    pub fn to_dimensions(&self) -> Vec<Dimension> {
        let mut dims = vec![
            Dimension::new(DIM_SYSTEM_ID, &self.system_id),
            Dimension::new(DIM_HOSTNAME, &self.hostname),
            Dimension::new(DIM_INSTANCE_TAGS, &self.instance_tags),
            Dimension::new(DIM_INSTANCE_GROUP, &self.instance_group),
            Dimension::new(DIM_DISPLAY_NAME, &self.display_name),
        ];
        if !self.nginx_id.is_empty() {
            dims.extend([
                Dimension::new(DIM_NGINX_ID, &self.nginx_id),
                Dimension::new(DIM_PUBLISHED_API, &self.published_api),
                Dimension::new(DIM_NGINX_TYPE, &self.nginx_type),
                Dimension::new(DIM_NGINX_BUILD, &self.nginx_build),
                Dimension::new(DIM_NGINX_VERSION, &self.nginx_version),
                Dimension::new(DIM_NGINX_CONF_PATH, &self.nginx_conf_path),
                Dimension::new(DIM_NGINX_ACCESS_LOGS, &self.nginx_access_logs),
            ]);
        } else if !self.published_api.is_empty() {
            dims.push(Dimension::new(DIM_PUBLISHED_API, &self.published_api));
        }
        dims
    }
}

// ----------------------------------------------------------------------------
// 2.5 Reports & Export Points
// ----------------------------------------------------------------------------

/// A batch of entities: one collector tick, or a finalized aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub entities: Vec<StatsEntity>,
}

impl MetricsReport {
    pub fn new(entities: Vec<StatsEntity>) -> Self {
        Self {
            timestamp: Utc::now(),
            entities,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.entities.iter().all(|e| e.metrics.is_empty())
    }

    pub fn metric_count(&self) -> usize {
        self.entities.iter().map(|e| e.metrics.len()).sum()
    }

    /// Flatten into exporter points, one per metric.
    pub fn to_points(&self) -> Vec<MetricPoint> {
        self.entities
            .iter()
            .flat_map(|entity| {
                entity.metrics.iter().map(move |metric| MetricPoint {
                    name: metric.name.clone(),
                    value: metric.value,
                    timestamp: entity.timestamp,
                    dimensions: entity.dimensions.clone(),
                })
            })
            .collect()
    }
}

impl Default for MetricsReport {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single timestamped, dimensioned point handed to the exporting layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub dimensions: Vec<Dimension>,
}
