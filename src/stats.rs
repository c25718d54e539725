// ============================================================================
// WINDOW STATISTICS
// ============================================================================
// Distribution summaries over one flush window of values: average, count,
// max, median and 95th percentile. An empty window yields zero for all.
// ============================================================================

/// Summary of the values seen in one window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub avg: f64,
    pub count: f64,
    pub max: f64,
    pub median: f64,
    pub pctl95: f64,
}

impl WindowStats {
    pub fn compute(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();

        let median = if n % 2 != 0 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        let rank = round_half_even(0.95 * n as f64) as usize;
        let pctl95 = sorted[rank.clamp(1, n) - 1];

        Self {
            avg: mean(values),
            count: n as f64,
            max: sorted[n - 1],
            median,
            pctl95,
        }
    }

    /// Metric samples under `prefix`: `prefix`, `prefix.count`, `prefix.max`,
    /// `prefix.median`, `prefix.pctl95`.
    pub fn samples(&self, prefix: &str) -> [(String, f64); 5] {
        [
            (prefix.to_string(), self.avg),
            (format!("{}.count", prefix), self.count),
            (format!("{}.max", prefix), self.max),
            (format!("{}.median", prefix), self.median),
            (format!("{}.pctl95", prefix), self.pctl95),
        ]
    }

    /// Like `samples` but without the plain average, for families where the
    /// average is reported under a different name.
    pub fn distribution_samples(&self, prefix: &str) -> [(String, f64); 4] {
        [
            (format!("{}.count", prefix), self.count),
            (format!("{}.max", prefix), self.max),
            (format!("{}.median", prefix), self.median),
            (format!("{}.pctl95", prefix), self.pctl95),
        ]
    }
}

/// Arithmetic mean, zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Banker's rounding: halves go to the nearest even integer.
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}
