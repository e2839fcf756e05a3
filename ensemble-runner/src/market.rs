//! Market data loading and alignment for replays and the live feed.
//!
//! Given the configured universe, loads one CSV per instrument and aligns
//! them on a common timeline. Implements the fallback policy:
//! 1. If `{data_dir}/{SYMBOL}.csv` exists → use it
//! 2. If not and `synthetic` is set → generate a seeded random walk (tagged)
//! 3. Otherwise → fail with a clear error
//!
//! Synthetic data is deterministic per symbol, so TRAIN/TEST runs over it are
//! reproducible.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use ensemble_core::domain::{Bar, Symbol, Timestamp};
use ensemble_core::source::MarketContext;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no data for '{symbol}' (looked in {looked_in:?}; use --synthetic for synthetic data)")]
    NoData {
        symbol: String,
        looked_in: Option<PathBuf>,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed CSV in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("bad timestamp '{value}' in {path}")]
    Timestamp { path: PathBuf, value: String },
    #[error("instruments share no common timestamps")]
    NoOverlap,
}

/// Options controlling where bars come from.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub data_dir: Option<PathBuf>,
    /// Generate synthetic bars when a CSV is missing.
    pub synthetic: bool,
    /// First synthetic trading day.
    pub start: NaiveDate,
    /// Number of synthetic bars per instrument.
    pub bars: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            synthetic: true,
            start: NaiveDate::from_ymd_opt(2022, 1, 3).unwrap_or_default(),
            bars: 500,
        }
    }
}

/// Bars for every instrument on one shared timeline.
///
/// `bars[symbol][i].timestamp == timeline[i]` for every symbol and index.
#[derive(Debug, Clone)]
pub struct MarketData {
    timeline: Vec<Timestamp>,
    bars: BTreeMap<Symbol, Vec<Bar>>,
}

impl MarketData {
    /// Keep only timestamps every instrument has a sane bar for.
    pub fn align(series: BTreeMap<Symbol, Vec<Bar>>) -> Result<Self, LoadError> {
        let mut common: Option<BTreeSet<Timestamp>> = None;
        let mut sane: BTreeMap<Symbol, BTreeMap<Timestamp, Bar>> = BTreeMap::new();
        for (symbol, bars) in series {
            let total = bars.len();
            let kept: BTreeMap<Timestamp, Bar> = bars
                .into_iter()
                .filter(|b| b.is_sane() && !b.is_void())
                .map(|b| (b.timestamp, b))
                .collect();
            if kept.len() < total {
                warn!(%symbol, dropped = total - kept.len(), "dropping void or inconsistent bars");
            }
            let stamps: BTreeSet<Timestamp> = kept.keys().copied().collect();
            common = Some(match common {
                Some(c) => c.intersection(&stamps).copied().collect(),
                None => stamps,
            });
            sane.insert(symbol, kept);
        }
        let timeline: Vec<Timestamp> = common.unwrap_or_default().into_iter().collect();
        if timeline.is_empty() {
            return Err(LoadError::NoOverlap);
        }
        let bars = sane
            .into_iter()
            .map(|(symbol, by_ts)| {
                let aligned = timeline.iter().filter_map(|t| by_ts.get(t).cloned()).collect();
                (symbol, aligned)
            })
            .collect();
        Ok(Self { timeline, bars })
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }

    pub fn timeline(&self) -> &[Timestamp] {
        &self.timeline
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.bars.keys()
    }

    pub fn bar(&self, symbol: &str, tick: usize) -> Option<&Bar> {
        self.bars.get(symbol).and_then(|b| b.get(tick))
    }

    pub fn close(&self, symbol: &str, tick: usize) -> Option<f64> {
        self.bar(symbol, tick).map(|b| b.close)
    }

    /// Up to `window` bars ending at `tick` (inclusive).
    pub fn context(&self, symbol: &str, tick: usize, window: usize) -> Option<MarketContext> {
        let bars = self.bars.get(symbol)?;
        let current = bars.get(tick)?;
        let from = (tick + 1).saturating_sub(window);
        Some(MarketContext::new(symbol, current.timestamp, bars[from..=tick].to_vec()))
    }

    /// Contexts for every instrument at `tick`.
    pub fn contexts(&self, tick: usize, window: usize) -> Vec<MarketContext> {
        self.bars
            .keys()
            .filter_map(|s| self.context(s, tick, window))
            .collect()
    }

    /// BLAKE3 over every bar in symbol order, for run provenance.
    pub fn dataset_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (symbol, bars) in &self.bars {
            hasher.update(symbol.as_bytes());
            for bar in bars {
                hasher.update(&bar.timestamp.timestamp().to_le_bytes());
                hasher.update(&bar.open.to_le_bytes());
                hasher.update(&bar.high.to_le_bytes());
                hasher.update(&bar.low.to_le_bytes());
                hasher.update(&bar.close.to_le_bytes());
                hasher.update(&bar.volume.to_le_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Loaded market plus provenance.
#[derive(Debug, Clone)]
pub struct LoadedMarket {
    pub data: MarketData,
    pub has_synthetic: bool,
    pub dataset_hash: String,
}

/// Load every instrument in `universe`, falling back to synthetic bars.
pub fn load_market(universe: &[String], opts: &LoadOptions) -> Result<LoadedMarket, LoadError> {
    let mut series = BTreeMap::new();
    let mut has_synthetic = false;
    for symbol in universe {
        let csv_path = opts.data_dir.as_ref().map(|d| d.join(format!("{symbol}.csv")));
        match csv_path {
            Some(path) if path.exists() => {
                series.insert(symbol.clone(), load_csv(&path, symbol)?);
            }
            _ if opts.synthetic => {
                warn!(%symbol, "generating synthetic data; results are tagged as synthetic");
                series.insert(symbol.clone(), generate_synthetic_bars(symbol, opts.start, opts.bars));
                has_synthetic = true;
            }
            _ => {
                return Err(LoadError::NoData {
                    symbol: symbol.clone(),
                    looked_in: opts.data_dir.clone(),
                })
            }
        }
    }
    let data = MarketData::align(series)?;
    let dataset_hash = data.dataset_hash();
    Ok(LoadedMarket {
        data,
        has_synthetic,
        dataset_hash,
    })
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: u64,
}

/// Accepts RFC 3339 timestamps or plain dates (taken as the 21:00 UTC close).
fn parse_timestamp(value: &str) -> Option<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(21, 0, 0)?))
}

/// Read `timestamp,open,high,low,close[,volume]` rows, sorted by time.
pub fn load_csv(path: &Path, symbol: &str) -> Result<Vec<Bar>, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));
    let mut bars = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let timestamp = parse_timestamp(row.timestamp.trim()).ok_or_else(|| LoadError::Timestamp {
            path: path.to_path_buf(),
            value: row.timestamp.clone(),
        })?;
        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

/// Seeded random walk with mild return autocorrelation, so trend and
/// reversion rules actually disagree. Weekdays only.
pub fn generate_synthetic_bars(symbol: &str, start: NaiveDate, count: usize) -> Vec<Bar> {
    let seed: [u8; 32] = *blake3::hash(symbol.as_bytes()).as_bytes();
    let mut rng = StdRng::from_seed(seed);

    let mut bars = Vec::with_capacity(count);
    let mut price = 100.0_f64;
    let mut prev_return = 0.0_f64;
    let mut day = start;

    while bars.len() < count {
        let weekday = day.weekday();
        if weekday == chrono::Weekday::Sat || weekday == chrono::Weekday::Sun {
            day += chrono::Duration::days(1);
            continue;
        }
        let daily_return = 0.25 * prev_return + rng.gen_range(-0.02..0.02);
        let open = price;
        let close = price * (1.0 + daily_return);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.008));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.008));
        let volume = rng.gen_range(500_000..5_000_000u64);
        let timestamp = match day.and_hms_opt(21, 0, 0) {
            Some(naive) => Utc.from_utc_datetime(&naive),
            None => break,
        };

        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        });
        price = close;
        prev_return = daily_return;
        day += chrono::Duration::days(1);
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn synthetic_is_deterministic_per_symbol() {
        let a = generate_synthetic_bars("SPY", start(), 50);
        let b = generate_synthetic_bars("SPY", start(), 50);
        let c = generate_synthetic_bars("QQQ", start(), 50);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 50);
        assert!(a.iter().all(|bar| bar.is_sane()));
        assert!(a
            .iter()
            .all(|bar| !matches!(bar.timestamp.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)));
    }

    #[test]
    fn align_keeps_common_timestamps() {
        let spy = generate_synthetic_bars("SPY", start(), 20);
        let mut qqq = generate_synthetic_bars("QQQ", start(), 20);
        qqq.remove(5);
        let mut series = BTreeMap::new();
        series.insert("SPY".to_string(), spy);
        series.insert("QQQ".to_string(), qqq);
        let data = MarketData::align(series).unwrap();
        assert_eq!(data.len(), 19);
        for i in 0..data.len() {
            assert_eq!(data.bar("SPY", i).unwrap().timestamp, data.timeline()[i]);
            assert_eq!(data.bar("QQQ", i).unwrap().timestamp, data.timeline()[i]);
        }
    }

    #[test]
    fn context_is_bounded_by_window() {
        let mut series = BTreeMap::new();
        series.insert("SPY".to_string(), generate_synthetic_bars("SPY", start(), 30));
        let data = MarketData::align(series).unwrap();
        let ctx = data.context("SPY", 25, 10).unwrap();
        assert_eq!(ctx.bars.len(), 10);
        assert_eq!(ctx.timestamp, data.timeline()[25]);
        assert_eq!(data.context("SPY", 3, 10).unwrap().bars.len(), 4);
        assert!(data.context("SPY", 30, 10).is_none());
        assert!(data.context("TSLA", 3, 10).is_none());
    }

    #[test]
    fn loads_csv_with_dates_and_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "timestamp,open,high,low,close,volume").unwrap();
        writeln!(f, "2024-01-03,101,103,100,102,1100").unwrap();
        writeln!(f, "2024-01-02T21:00:00Z,100,102,99,101,1000").unwrap();
        drop(f);
        let bars = load_csv(&path, "SPY").unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 101.0);
        assert_eq!(bars[1].timestamp, Utc.with_ymd_and_hms(2024, 1, 3, 21, 0, 0).unwrap());
    }

    #[test]
    fn bad_timestamp_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SPY.csv");
        std::fs::write(&path, "timestamp,open,high,low,close\nyesterday,1,1,1,1\n").unwrap();
        assert!(matches!(load_csv(&path, "SPY"), Err(LoadError::Timestamp { .. })));
    }

    #[test]
    fn missing_data_without_synthetic_fails() {
        let opts = LoadOptions {
            synthetic: false,
            ..LoadOptions::default()
        };
        assert!(matches!(
            load_market(&["SPY".to_string()], &opts),
            Err(LoadError::NoData { .. })
        ));
    }

    #[test]
    fn synthetic_fallback_is_tagged() {
        let loaded = load_market(&["SPY".to_string(), "QQQ".to_string()], &LoadOptions::default()).unwrap();
        assert!(loaded.has_synthetic);
        assert_eq!(loaded.data.len(), 500);
        assert_eq!(loaded.dataset_hash.len(), 64);
    }
}
