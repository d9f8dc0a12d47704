use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PRICING_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PriceRow {
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    #[serde(default)]
    pub batch_input_per_1k: Option<f64>,
    #[serde(default)]
    pub batch_output_per_1k: Option<f64>,
    #[serde(default)]
    pub file_search_per_1k: Option<f64>,
    #[serde(default)]
    pub storage_per_gb_day: Option<f64>,
}

/// Consumed pricing table. Ingestion (scraping, manual refresh) happens
/// elsewhere; the run engine only reads the cached table and decides whether
/// receipts must be flagged as estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PriceTable {
    #[serde(default)]
    pub as_of: Option<i64>,
    #[serde(default)]
    pub rows: BTreeMap<String, PriceRow>,
}

impl PriceTable {
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::builtin_fallback();
        };
        match serde_json::from_str::<PriceTable>(&raw) {
            Ok(table) if !table.rows.is_empty() => table,
            _ => Self::builtin_fallback(),
        }
    }

    /// Minimal baseline so cost accounting keeps working with no cache on
    /// disk. `as_of: None` keeps every receipt flagged as estimated.
    pub fn builtin_fallback() -> Self {
        let mut rows = BTreeMap::new();
        for (model, input, output) in [
            ("gpt-4o-mini", 0.15, 0.60),
            ("gpt-4o", 5.00, 15.00),
        ] {
            rows.insert(
                model.to_string(),
                PriceRow {
                    model: model.to_string(),
                    input_per_1k: input,
                    output_per_1k: output,
                    batch_input_per_1k: Some(input / 2.0),
                    batch_output_per_1k: Some(output / 2.0),
                    file_search_per_1k: None,
                    storage_per_gb_day: None,
                },
            );
        }
        Self { as_of: None, rows }
    }

    pub fn get(&self, model: &str) -> Option<&PriceRow> {
        self.rows.get(model)
    }

    pub fn is_stale(&self, now: i64) -> bool {
        match self.as_of {
            Some(as_of) => now.saturating_sub(as_of) > PRICING_TTL_SECS,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBreakdown {
    pub total: f64,
    pub tool_cost: f64,
    pub storage_cost: f64,
}

pub fn compute_cost(
    row: Option<&PriceRow>,
    input_tokens: u64,
    output_tokens: u64,
    is_batch: bool,
    used_file_search: bool,
    storage_gb_days: f64,
) -> CostBreakdown {
    let Some(row) = row else {
        return CostBreakdown::default();
    };
    let input_rate = if is_batch {
        row.batch_input_per_1k.unwrap_or(row.input_per_1k)
    } else {
        row.input_per_1k
    };
    let output_rate = if is_batch {
        row.batch_output_per_1k.unwrap_or(row.output_per_1k)
    } else {
        row.output_per_1k
    };
    let base =
        (input_tokens as f64 / 1000.0) * input_rate + (output_tokens as f64 / 1000.0) * output_rate;

    let tool_cost = if used_file_search {
        row.file_search_per_1k
            .map(|rate| (input_tokens as f64 / 1000.0) * rate)
            .unwrap_or(0.0)
    } else {
        0.0
    };
    let storage_cost = if storage_gb_days > 0.0 {
        row.storage_per_gb_day
            .map(|rate| storage_gb_days * rate)
            .unwrap_or(0.0)
    } else {
        0.0
    };

    CostBreakdown {
        total: base + tool_cost + storage_cost,
        tool_cost,
        storage_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> PriceRow {
        PriceRow {
            model: "m".to_string(),
            input_per_1k: 1.0,
            output_per_1k: 2.0,
            batch_input_per_1k: Some(0.5),
            batch_output_per_1k: Some(1.0),
            file_search_per_1k: Some(0.1),
            storage_per_gb_day: Some(0.01),
        }
    }

    #[test]
    fn batch_rates_and_tool_costs_apply() {
        let normal = compute_cost(Some(&row()), 1000, 1000, false, false, 0.0);
        assert!((normal.total - 3.0).abs() < 1e-9);

        let batch = compute_cost(Some(&row()), 1000, 1000, true, false, 0.0);
        assert!((batch.total - 1.5).abs() < 1e-9);

        let with_tool = compute_cost(Some(&row()), 1000, 0, false, true, 0.0);
        assert!((with_tool.tool_cost - 0.1).abs() < 1e-9);

        let with_storage = compute_cost(Some(&row()), 0, 0, false, false, 2.0);
        assert!((with_storage.storage_cost - 0.02).abs() < 1e-9);

        assert_eq!(compute_cost(None, 10, 10, false, false, 0.0).total, 0.0);
    }

    #[test]
    fn staleness_follows_as_of_and_ttl() {
        let mut table = PriceTable::builtin_fallback();
        assert!(table.is_stale(0), "no as_of means always stale");
        table.as_of = Some(1_000);
        assert!(!table.is_stale(1_000 + PRICING_TTL_SECS));
        assert!(table.is_stale(1_001 + PRICING_TTL_SECS));
    }

    #[test]
    fn load_falls_back_when_cache_is_absent_or_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = PriceTable::load(&temp.path().join("absent.json"));
        assert!(missing.get("gpt-4o-mini").is_some());

        let bad = temp.path().join("bad.json");
        std::fs::write(&bad, "{not json").expect("write");
        let loaded = PriceTable::load(&bad);
        assert!(loaded.get("gpt-4o").is_some());
    }
}
