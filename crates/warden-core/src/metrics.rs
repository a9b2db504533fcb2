//! Metric snapshots and the delta importer.
//!
//! Nodes report metrics as deltas: each [`MetricUpdate`](crate::protocol::messages::MetricUpdate)
//! defines any metrics the link has not seen yet and carries additive deltas
//! for known metric ids. The [`Importer`] folds those deltas into absolute
//! readings and is the canonical authority for observed values within one
//! envelope instance.

use std::collections::HashMap;

use serde::Serialize;

use crate::protocol::messages::{MetricType, MetricUpdate};

/// Histogram bucket boundaries used by runtime-generated metrics.
///
/// Adjacent buckets differ from each other by 2x or 2.5x. Intended for
/// non-negative values only.
pub const GENERATED_BUCKETS: &[f64] = &[
    1.0,
    2.0,
    5.0,
    10.0,
    20.0,
    50.0,
    100.0,
    200.0,
    500.0,
    1_000.0,
    2_000.0,
    5_000.0,
    10_000.0,
    20_000.0,
    50_000.0,
    100_000.0,
    200_000.0,
    500_000.0,
    1_000_000.0,
    2_000_000.0,
    5_000_000.0,
    10_000_000.0,
    20_000_000.0,
    50_000_000.0,
    100_000_000.0,
    200_000_000.0,
    500_000_000.0,
    1_000_000_000.0,
    2_000_000_000.0,
    5_000_000_000.0,
];

/// An absolute reading of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// Link-scoped metric id.
    pub id: u64,
    /// Metric name.
    pub name: String,
    /// Metric type.
    pub typ: MetricType,
    /// Human-readable description.
    pub help: String,
    /// Metric labels.
    pub labels: HashMap<String, String>,
    /// Current value. For histograms this is the sum of observations.
    pub value: f64,
    /// Histogram bucket boundaries; empty for counters and gauges.
    pub bounds: Vec<f64>,
    /// Cumulative per-bucket counts; empty for counters and gauges.
    pub counts: Vec<u64>,
}

/// Errors produced while importing a metric update.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// A definition arrived for an id that is already defined.
    #[error("metric {0} redefined")]
    Redefined(u64),

    /// A value delta referenced an id with no prior definition.
    #[error("metric {0} used before being defined")]
    Undefined(u64),

    /// A histogram delta carried a different bucket count than the
    /// definition.
    #[error("metric {id}: {got} bucket counts, definition has {want}")]
    BucketMismatch {
        /// Metric id.
        id: u64,
        /// Counts carried by the delta.
        got: usize,
        /// Counts the definition requires.
        want: usize,
    },
}

/// Translates per-link metric deltas into absolute readings.
///
/// Stateful: remembers every definition and the last absolute value per
/// metric id for the lifetime of the control link.
#[derive(Debug, Default)]
pub struct Importer {
    metrics: HashMap<u64, MetricSnapshot>,
}

impl Importer {
    /// Create an empty importer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a delta update into the absolute state.
    ///
    /// Returns the absolute snapshots of the metrics named by the update,
    /// in the order they appear on the wire (definitions first, then
    /// values).
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] on redefinition, an unknown id, or a bucket
    /// count mismatch. A failed import leaves previously imported state
    /// intact, though earlier entries of the same update may already have
    /// been applied.
    pub fn import(&mut self, update: &MetricUpdate) -> Result<Vec<MetricSnapshot>, ImportError> {
        let mut touched = Vec::with_capacity(update.defs.len() + update.values.len());

        for def in &update.defs {
            if self.metrics.contains_key(&def.id) {
                return Err(ImportError::Redefined(def.id));
            }
            let counts = vec![0; def.bounds.len() + usize::from(!def.bounds.is_empty())];
            self.metrics.insert(
                def.id,
                MetricSnapshot {
                    id: def.id,
                    name: def.name.clone(),
                    typ: def.typ(),
                    help: def.help.clone(),
                    labels: def.labels.clone(),
                    value: 0.0,
                    bounds: def.bounds.clone(),
                    counts,
                },
            );
            touched.push(def.id);
        }

        for delta in &update.values {
            let snapshot = self
                .metrics
                .get_mut(&delta.id)
                .ok_or(ImportError::Undefined(delta.id))?;
            if !delta.counts.is_empty() && delta.counts.len() != snapshot.counts.len() {
                return Err(ImportError::BucketMismatch {
                    id: delta.id,
                    got: delta.counts.len(),
                    want: snapshot.counts.len(),
                });
            }
            snapshot.value += delta.value;
            for (total, d) in snapshot.counts.iter_mut().zip(&delta.counts) {
                *total += d;
            }
            touched.push(delta.id);
        }

        touched.dedup();
        Ok(touched
            .into_iter()
            .map(|id| self.metrics[&id].clone())
            .collect())
    }

    /// Returns the absolute snapshot for a metric id, if defined.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&MetricSnapshot> {
        self.metrics.get(&id)
    }

    /// Number of metrics defined on this link so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns true if no metric has been defined yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::messages::{MetricDef, MetricValue};

    use super::*;

    fn counter_def(id: u64, name: &str) -> MetricDef {
        MetricDef {
            id,
            name: name.to_string(),
            typ: MetricType::Counter as i32,
            help: String::new(),
            labels: HashMap::new(),
            bounds: Vec::new(),
        }
    }

    fn delta(id: u64, value: f64) -> MetricValue {
        MetricValue {
            id,
            value,
            counts: Vec::new(),
        }
    }

    #[test]
    fn test_deltas_accumulate() {
        let mut importer = Importer::new();

        let first = MetricUpdate {
            defs: vec![counter_def(1, "requests")],
            values: vec![delta(1, 3.0)],
        };
        let second = MetricUpdate {
            defs: Vec::new(),
            values: vec![delta(1, 4.0)],
        };

        importer.import(&first).unwrap();
        let snapshots = importer.import(&second).unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].value, 7.0);
        assert_eq!(importer.get(1).unwrap().value, 7.0);
    }

    #[test]
    fn test_offline_sum_matches_import_order() {
        let deltas = [2.0, 5.0, 0.5, 10.0, 1.25];
        let mut importer = Importer::new();
        importer
            .import(&MetricUpdate {
                defs: vec![counter_def(9, "latency")],
                values: Vec::new(),
            })
            .unwrap();

        for d in deltas {
            importer
                .import(&MetricUpdate {
                    defs: Vec::new(),
                    values: vec![delta(9, d)],
                })
                .unwrap();
        }

        assert_eq!(importer.get(9).unwrap().value, deltas.iter().sum::<f64>());
    }

    #[test]
    fn test_histogram_counts_accumulate() {
        let mut importer = Importer::new();
        let def = MetricDef {
            id: 4,
            name: "sizes".to_string(),
            typ: MetricType::Histogram as i32,
            help: String::new(),
            labels: HashMap::new(),
            bounds: vec![10.0, 100.0],
        };

        importer
            .import(&MetricUpdate {
                defs: vec![def],
                values: vec![MetricValue {
                    id: 4,
                    value: 12.0,
                    counts: vec![1, 1, 0],
                }],
            })
            .unwrap();
        let snapshots = importer
            .import(&MetricUpdate {
                defs: Vec::new(),
                values: vec![MetricValue {
                    id: 4,
                    value: 200.0,
                    counts: vec![0, 0, 1],
                }],
            })
            .unwrap();

        assert_eq!(snapshots[0].counts, vec![1, 1, 1]);
        assert_eq!(snapshots[0].value, 212.0);
    }

    #[test]
    fn test_redefinition_rejected() {
        let mut importer = Importer::new();
        let update = MetricUpdate {
            defs: vec![counter_def(1, "a"), counter_def(1, "b")],
            values: Vec::new(),
        };
        assert!(matches!(
            importer.import(&update),
            Err(ImportError::Redefined(1))
        ));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut importer = Importer::new();
        let update = MetricUpdate {
            defs: Vec::new(),
            values: vec![delta(77, 1.0)],
        };
        assert!(matches!(
            importer.import(&update),
            Err(ImportError::Undefined(77))
        ));
    }

    #[test]
    fn test_bucket_mismatch_rejected() {
        let mut importer = Importer::new();
        let def = MetricDef {
            id: 2,
            name: "h".to_string(),
            typ: MetricType::Histogram as i32,
            help: String::new(),
            labels: HashMap::new(),
            bounds: vec![1.0],
        };
        importer
            .import(&MetricUpdate {
                defs: vec![def],
                values: Vec::new(),
            })
            .unwrap();

        let update = MetricUpdate {
            defs: Vec::new(),
            values: vec![MetricValue {
                id: 2,
                value: 0.0,
                counts: vec![1, 2, 3, 4],
            }],
        };
        assert!(matches!(
            importer.import(&update),
            Err(ImportError::BucketMismatch { id: 2, got: 4, want: 2 })
        ));
    }
}
