//! Table statistics: reservoir sampling, per-column stats, equi-depth
//! histograms. `ANALYZE` drives this from the dispatcher; INSERT/DELETE only
//! touch the incremental row count.

use crate::db::schema::TableSchema;
use ahash::AHashSet;
use micadb_types::{Row, RowKey, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const RESERVOIR_CAPACITY: usize = 1000;
pub const DEFAULT_HISTOGRAM_BUCKETS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub min: Value,
    pub max: Value,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub name: String,
    pub distinct_count: usize,
    pub null_count: usize,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// Average byte width of text/blob values; `None` for other classes.
    pub avg_width: Option<f64>,
    pub histogram: Vec<Bucket>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableStats {
    pub row_count: i64,
    pub columns: Vec<ColumnStats>,
}

/// Algorithm-R reservoir over scanned rows.
pub struct Reservoir {
    capacity: usize,
    seen: usize,
    rows: Vec<Row>,
    rng: StdRng,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Reservoir {
            capacity,
            seen: 0,
            rows: Vec::with_capacity(capacity.min(1024)),
            rng: StdRng::seed_from_u64(0x7374_6174),
        }
    }

    pub fn offer(&mut self, row: Row) {
        self.seen += 1;
        if self.rows.len() < self.capacity {
            self.rows.push(row);
            return;
        }
        let j = self.rng.gen_range(0..self.seen);
        if j < self.capacity {
            self.rows[j] = row;
        }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Derive full table statistics from a sample and the true row count.
pub fn derive_stats(
    schema: &TableSchema,
    sample: &[Row],
    total_rows: i64,
    histogram_buckets: usize,
) -> TableStats {
    let mut columns = Vec::with_capacity(schema.columns.len());
    for (i, col) in schema.columns.iter().enumerate() {
        let mut distinct: AHashSet<RowKey> = AHashSet::new();
        let mut null_count = 0usize;
        let mut non_null: Vec<&Value> = Vec::new();
        let mut width_sum = 0usize;
        let mut width_n = 0usize;
        for row in sample {
            let v = &row[i];
            if v.is_null() {
                null_count += 1;
                continue;
            }
            distinct.insert(RowKey::of_value(v));
            non_null.push(v);
            match v {
                Value::Text { v, .. } => {
                    width_sum += v.len();
                    width_n += 1;
                }
                Value::Blob(b) => {
                    width_sum += b.len();
                    width_n += 1;
                }
                _ => {}
            }
        }
        non_null.sort_by(|a, b| a.total_cmp(b));
        columns.push(ColumnStats {
            name: col.name.clone(),
            distinct_count: distinct.len(),
            null_count,
            min: non_null.first().map(|v| (*v).clone()),
            max: non_null.last().map(|v| (*v).clone()),
            avg_width: (width_n > 0).then(|| width_sum as f64 / width_n as f64),
            histogram: equi_depth(&non_null, histogram_buckets),
        });
    }
    TableStats {
        row_count: total_rows,
        columns,
    }
}

/// Split sorted values into up to `buckets` runs of near-equal count;
/// boundaries are each run's min and max.
fn equi_depth(sorted: &[&Value], buckets: usize) -> Vec<Bucket> {
    if sorted.is_empty() || buckets == 0 {
        return Vec::new();
    }
    let buckets = buckets.min(sorted.len());
    let per = sorted.len() / buckets;
    let extra = sorted.len() % buckets;
    let mut out = Vec::with_capacity(buckets);
    let mut at = 0usize;
    for b in 0..buckets {
        let take = per + usize::from(b < extra);
        let run = &sorted[at..at + take];
        out.push(Bucket {
            min: run[0].clone(),
            max: run[run.len() - 1].clone(),
            count: run.len(),
        });
        at += take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnSchema, ColumnType};

    fn schema(cols: &[&str]) -> TableSchema {
        TableSchema {
            name: "t".into(),
            columns: cols
                .iter()
                .map(|c| ColumnSchema {
                    name: c.to_string(),
                    ty: ColumnType::Int,
                    serial: false,
                    constraints: vec![],
                })
                .collect(),
            constraints: vec![],
            root_page: 1,
            next_rowid: 1,
            max_integer_pk: 0,
        }
    }

    #[test]
    fn reservoir_keeps_everything_under_capacity() {
        let mut r = Reservoir::new(10);
        for i in 0..7 {
            r.offer(vec![Value::int(i)]);
        }
        assert_eq!(r.seen(), 7);
        assert_eq!(r.into_rows().len(), 7);
    }

    #[test]
    fn reservoir_caps_at_capacity() {
        let mut r = Reservoir::new(100);
        for i in 0..5000 {
            r.offer(vec![Value::int(i)]);
        }
        assert_eq!(r.seen(), 5000);
        assert_eq!(r.into_rows().len(), 100);
    }

    #[test]
    fn derive_counts_nulls_distincts_and_bounds() {
        let sample = vec![
            vec![Value::int(3)],
            vec![Value::int(1)],
            vec![Value::Null],
            vec![Value::int(3)],
        ];
        let stats = derive_stats(&schema(&["x"]), &sample, 4, 4);
        let c = &stats.columns[0];
        assert_eq!(c.null_count, 1);
        assert_eq!(c.distinct_count, 2);
        assert_eq!(c.min, Some(Value::int(1)));
        assert_eq!(c.max, Some(Value::int(3)));
        assert_eq!(stats.row_count, 4);
    }

    #[test]
    fn equi_depth_buckets_balance() {
        let sample: Vec<Row> = (1..=8).map(|i| vec![Value::int(i)]).collect();
        let stats = derive_stats(&schema(&["x"]), &sample, 8, 4);
        let hist = &stats.columns[0].histogram;
        assert_eq!(hist.len(), 4);
        assert!(hist.iter().all(|b| b.count == 2));
        assert_eq!(hist[0].min, Value::int(1));
        assert_eq!(hist[3].max, Value::int(8));
    }

    #[test]
    fn histogram_of_empty_column_is_empty() {
        let sample = vec![vec![Value::Null]];
        let stats = derive_stats(&schema(&["x"]), &sample, 1, 4);
        assert!(stats.columns[0].histogram.is_empty());
    }
}
