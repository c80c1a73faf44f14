// =============================================================================
// Candle processor — per-(symbol, timeframe) buffers, emission gate, and
// higher-timeframe aggregation
// =============================================================================
//
// The processor owns its buffers outright: one task feeds it, nothing else
// reads them. Updates are idempotent on `(symbol, timeframe, open_ts)`, so
// duplicate deliveries after a reconnect collapse instead of re-emitting.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use tracing::{debug, error, warn};

use crate::candle::Candle;
use crate::error::ConfigError;
use crate::input::{RunnerConfig, StreamInput};
use crate::timeframe::Timeframe;

// ---------------------------------------------------------------------------
// SeriesBuffer — bounded ring of recent candles for one (symbol, timeframe)
// ---------------------------------------------------------------------------

/// What an incoming candle did to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateOutcome {
    /// New interval appended.
    Appended,
    /// In-progress interval overwritten in place.
    ReplacedOpen,
    /// Same interval arrived again after it was already closed.
    DuplicateClosed,
    /// Older than the newest entry; ignored.
    Stale,
}

/// Ring buffer of the most recent candles, newest last. The in-progress
/// candle is continuously overwritten in place; closed candles are permanent
/// and the ring is trimmed to `cap`.
#[derive(Debug)]
pub(crate) struct SeriesBuffer {
    data: VecDeque<Candle>,
    cap: usize,
}

impl SeriesBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(cap + 1),
            cap,
        }
    }

    pub(crate) fn update(&mut self, candle: Candle) -> UpdateOutcome {
        if let Some(last) = self.data.back() {
            if candle.open_ts < last.open_ts {
                return UpdateOutcome::Stale;
            }
            if candle.open_ts == last.open_ts {
                let was_closed = last.is_closed;
                *self.data.back_mut().expect("back exists") = candle;
                return if was_closed {
                    UpdateOutcome::DuplicateClosed
                } else {
                    UpdateOutcome::ReplacedOpen
                };
            }
        }
        self.data.push_back(candle);
        while self.data.len() > self.cap {
            self.data.pop_front();
        }
        UpdateOutcome::Appended
    }

    /// Index of the entry opening exactly at `open_ts`.
    pub(crate) fn position(&self, open_ts: i64) -> Option<usize> {
        self.data.iter().position(|c| c.open_ts == open_ts)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.data.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}

// ---------------------------------------------------------------------------
// CandleProcessor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CandleProcessor {
    base_tf: Timeframe,
    /// Validated aggregation targets, ascending by duration.
    targets: Vec<Timeframe>,
    emit_only_closed: bool,
    emit_warmup: bool,
    base_cap: usize,
    buffers: HashMap<(String, Timeframe), SeriesBuffer>,
}

impl CandleProcessor {
    /// Build a processor for one stream. Fails fast on configuration errors
    /// (aggregation without warmup, no symbols); incompatible aggregation
    /// targets are dropped with a warning.
    pub fn new(input: &StreamInput, config: &RunnerConfig) -> Result<Self, ConfigError> {
        input.validate()?;

        if !input.aggregate_list.is_empty() && !config.active_warmup {
            return Err(ConfigError::WarmupRequired);
        }

        let base_tf = input.timeframe;
        let mut targets: Vec<Timeframe> = Vec::new();
        for &target in &input.aggregate_list {
            if base_tf.can_aggregate_to(target) {
                targets.push(target);
            } else {
                warn!(
                    base = %base_tf,
                    target = %target,
                    "timeframe cannot be aggregated from the base stream, dropping it"
                );
            }
        }
        targets.sort();
        targets.dedup();

        // The base ring has to hold at least one full bucket of the largest
        // target plus a safety margin.
        let base_cap = targets
            .iter()
            .filter_map(|t| {
                let tgt = t.fixed_duration_secs()?;
                let base = base_tf.fixed_duration_secs()?;
                Some((tgt / base) as usize + 8)
            })
            .max()
            .unwrap_or(0)
            .max(base_tf.buffer_size());

        let mut buffers = HashMap::new();
        for symbol in &input.symbols {
            buffers.insert((symbol.clone(), base_tf), SeriesBuffer::new(base_cap));
            for &target in &targets {
                buffers.insert(
                    (symbol.clone(), target),
                    SeriesBuffer::new(target.buffer_size()),
                );
            }
        }

        Ok(Self {
            base_tf,
            targets,
            emit_only_closed: config.emit_only_closed_candles,
            emit_warmup: config.emit_warmup,
            base_cap,
            buffers,
        })
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.base_tf
    }

    pub fn targets(&self) -> &[Timeframe] {
        &self.targets
    }

    /// Largest configured aggregation target, used to size the warmup fetch.
    pub fn largest_target(&self) -> Option<Timeframe> {
        self.targets.last().copied()
    }

    /// Seed a symbol's base buffer with historical candles. Returns the
    /// candles to deliver downstream (empty unless warmup emission is on).
    pub fn seed(&mut self, symbol: &str, mut candles: Vec<Candle>) -> Vec<Candle> {
        candles.sort_by_key(|c| c.open_ts);

        let buffer = self
            .buffers
            .entry((symbol.to_string(), self.base_tf))
            .or_insert_with(|| SeriesBuffer::new(self.base_cap));

        let mut loaded = 0usize;
        let mut emitted = Vec::new();
        for mut candle in candles {
            candle.is_closed = true;
            let outcome = buffer.update(candle.clone());
            if matches!(outcome, UpdateOutcome::Appended) {
                loaded += 1;
                if self.emit_warmup {
                    emitted.push(candle);
                }
            }
        }
        debug!(symbol, timeframe = %self.base_tf, loaded, "warmup candles loaded");
        emitted
    }

    /// Apply one normalized candle. Returns the records to deliver, in
    /// order: the base candle (when the gate passes), then any aggregates
    /// whose bucket it closed, smallest target first.
    pub fn process(&mut self, candle: Candle) -> Vec<Candle> {
        if candle.timeframe != self.base_tf {
            debug!(
                timeframe = %candle.timeframe,
                expected = %self.base_tf,
                "dropping candle from unexpected timeframe"
            );
            return Vec::new();
        }

        let symbol = candle.symbol.clone();
        let is_closed = candle.is_closed;
        let trigger_end = candle.end_ts;

        let buffer = self
            .buffers
            .entry((symbol.clone(), self.base_tf))
            .or_insert_with(|| SeriesBuffer::new(self.base_cap));

        let mut out = Vec::new();
        match buffer.update(candle.clone()) {
            UpdateOutcome::Stale => {
                debug!(key = %candle.key(), "stale candle dropped");
                return out;
            }
            UpdateOutcome::DuplicateClosed => {
                debug!(key = %candle.key(), "duplicate closed candle dropped");
                return out;
            }
            UpdateOutcome::Appended | UpdateOutcome::ReplacedOpen => {}
        }

        if is_closed || !self.emit_only_closed {
            out.push(candle);
        }

        // Aggregation triggers only on closed base candles: a bucket is
        // complete exactly when its last base interval is.
        if is_closed {
            let targets = self.targets.clone();
            for target in targets {
                let dur = target.fixed_duration_secs().expect("validated target");
                if (trigger_end + 1) % dur != 0 {
                    continue;
                }
                if let Some(aggregate) = self.aggregate(&symbol, target, trigger_end) {
                    self.buffers
                        .entry((symbol.clone(), target))
                        .or_insert_with(|| SeriesBuffer::new(target.buffer_size()))
                        .update(aggregate.clone());
                    out.push(aggregate);
                }
            }
        }

        out
    }

    /// Roll the base candles of `[trigger_end - dur + 1, trigger_end]` into
    /// one `target` candle. `None` when the bucket is incomplete at the
    /// front or the result violates the candle invariants.
    fn aggregate(&self, symbol: &str, target: Timeframe, trigger_end: i64) -> Option<Candle> {
        let dur = target.fixed_duration_secs()?;
        let target_open = trigger_end + 1 - dur;

        let buffer = self.buffers.get(&(symbol.to_string(), self.base_tf))?;
        let start = match buffer.position(target_open) {
            Some(idx) => idx,
            None => {
                warn!(
                    symbol,
                    target = %target,
                    target_open,
                    "bucket start missing from buffer, skipping aggregation"
                );
                return None;
            }
        };

        let mut first = None;
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut close = 0.0;
        let mut volume = 0.0;
        let mut quote_volume: Option<f64> = None;
        let mut count = 0u32;

        for c in buffer.iter().skip(start) {
            if c.open_ts < target_open || c.open_ts > trigger_end {
                break;
            }
            if first.is_none() {
                first = Some(c.clone());
            }
            high = high.max(c.high);
            low = low.min(c.low);
            close = c.close;
            volume += c.volume;
            if let Some(q) = c.quote_volume {
                quote_volume = Some(quote_volume.unwrap_or(0.0) + q);
            }
            count += 1;
        }

        let first = first?;
        let aggregate = Candle {
            source: first.source.clone(),
            symbol: symbol.to_string(),
            timeframe: target,
            open_ts: target_open,
            end_ts: trigger_end,
            open: first.open,
            high,
            low,
            close,
            volume,
            quote_volume,
            is_closed: true,
            count: Some(count),
        };

        if let Err(e) = aggregate.validate() {
            error!(
                symbol,
                target = %target,
                error = %e,
                "aggregated candle failed validation, emission aborted"
            );
            return None;
        }

        Some(aggregate)
    }

    #[cfg(test)]
    pub(crate) fn buffer_len(&self, symbol: &str, tf: Timeframe) -> usize {
        self.buffers
            .get(&(symbol.to_string(), tf))
            .map_or(0, SeriesBuffer::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::StreamKind;

    fn base_candle(open_ts: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            source: "binance".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_ts,
            end_ts: open_ts + 59,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            quote_volume: Some(2.0),
            is_closed,
            count: None,
        }
    }

    fn input(aggregates: Vec<Timeframe>) -> StreamInput {
        StreamInput::new(StreamKind::Kline, vec!["BTCUSDT".into()], Timeframe::M1)
            .with_aggregates(aggregates)
    }

    fn config() -> RunnerConfig {
        RunnerConfig::default()
    }

    // -- SeriesBuffer ------------------------------------------------------

    #[test]
    fn ring_trims_to_capacity() {
        let mut buf = SeriesBuffer::new(3);
        for i in 0..5 {
            assert_eq!(
                buf.update(base_candle(i * 60, 100.0 + i as f64, true)),
                UpdateOutcome::Appended
            );
        }
        assert_eq!(buf.len(), 3);
        let closes: Vec<f64> = buf.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_candle_replaced_in_place() {
        let mut buf = SeriesBuffer::new(10);
        assert_eq!(
            buf.update(base_candle(0, 50.0, false)),
            UpdateOutcome::Appended
        );
        assert_eq!(
            buf.update(base_candle(0, 51.0, false)),
            UpdateOutcome::ReplacedOpen
        );
        assert_eq!(
            buf.update(base_candle(0, 52.0, true)),
            UpdateOutcome::ReplacedOpen
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.iter().next().unwrap().close, 52.0);
    }

    #[test]
    fn closed_duplicate_detected() {
        let mut buf = SeriesBuffer::new(10);
        buf.update(base_candle(0, 50.0, true));
        assert_eq!(
            buf.update(base_candle(0, 50.0, true)),
            UpdateOutcome::DuplicateClosed
        );
    }

    #[test]
    fn stale_candle_ignored() {
        let mut buf = SeriesBuffer::new(10);
        buf.update(base_candle(60, 50.0, true));
        assert_eq!(buf.update(base_candle(0, 49.0, true)), UpdateOutcome::Stale);
        assert_eq!(buf.len(), 1);
    }

    // -- Processor: gate and dedup ----------------------------------------

    #[test]
    fn closed_only_gate_holds_back_updates() {
        let mut p = CandleProcessor::new(&input(vec![]), &config()).unwrap();
        assert!(p.process(base_candle(0, 100.0, false)).is_empty());
        let out = p.process(base_candle(0, 101.0, true));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_closed);
    }

    #[test]
    fn open_gate_emits_every_update() {
        let mut cfg = config();
        cfg.emit_only_closed_candles = false;
        let mut p = CandleProcessor::new(&input(vec![]), &cfg).unwrap();
        assert_eq!(p.process(base_candle(0, 100.0, false)).len(), 1);
        assert_eq!(p.process(base_candle(0, 100.5, false)).len(), 1);
        assert_eq!(p.process(base_candle(0, 101.0, true)).len(), 1);
    }

    #[test]
    fn reconnect_duplicates_not_reemitted() {
        let mut p = CandleProcessor::new(&input(vec![]), &config()).unwrap();
        assert_eq!(p.process(base_candle(0, 100.0, true)).len(), 1);
        // Same closed interval redelivered after a reconnect.
        assert!(p.process(base_candle(0, 100.0, true)).is_empty());
        // Older interval replayed entirely.
        assert_eq!(p.process(base_candle(60, 101.0, true)).len(), 1);
        assert!(p.process(base_candle(0, 100.0, true)).is_empty());
    }

    // -- Processor: aggregation -------------------------------------------

    // 1_700_000_100 sits on a 15m boundary, so it also opens 1m and 5m
    // buckets. The aggregation tests below lean on that.
    const BUCKET: i64 = 1_700_000_100;

    #[test]
    fn five_one_minute_candles_roll_into_5m() {
        let mut p = CandleProcessor::new(&input(vec![Timeframe::M5]), &config()).unwrap();

        let opens = [
            BUCKET,
            BUCKET + 60,
            BUCKET + 120,
            BUCKET + 180,
            BUCKET + 240,
        ];
        let volumes = [1.0, 2.0, 3.0, 4.0, 5.0];
        let highs = [10.0, 11.0, 9.0, 12.0, 8.0];
        let lows = [7.0, 6.0, 5.0, 4.0, 3.0];

        let mut last_out = Vec::new();
        for i in 0..5 {
            let mut c = base_candle(opens[i], 7.5, true);
            c.volume = volumes[i];
            c.high = highs[i];
            c.low = lows[i];
            c.open = 7.5;
            c.close = 7.5;
            last_out = p.process(c);
        }

        // Fifth message: the 1m candle first, then the completed 5m bucket.
        assert_eq!(last_out.len(), 2);
        assert_eq!(last_out[0].timeframe, Timeframe::M1);

        let agg = &last_out[1];
        assert_eq!(agg.timeframe, Timeframe::M5);
        assert_eq!(agg.open_ts, BUCKET);
        assert_eq!(agg.end_ts, BUCKET + 299);
        assert_eq!(agg.high, 12.0);
        assert_eq!(agg.low, 3.0);
        assert_eq!(agg.volume, 15.0);
        assert_eq!(agg.count, Some(5));
        assert!(agg.is_closed);
        assert_eq!(agg.open, 7.5);
        assert_eq!(agg.close, 7.5);
        // Quote volume is conserved too.
        assert_eq!(agg.quote_volume, Some(10.0));
    }

    #[test]
    fn incomplete_bucket_is_skipped() {
        let mut p = CandleProcessor::new(&input(vec![Timeframe::M5]), &config()).unwrap();
        // Join mid-bucket: first candle the processor sees is :04 of the
        // five-minute window.
        let out = p.process(base_candle(BUCKET + 240, 7.5, true));
        // The base candle is emitted, but no 5m aggregate appears.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timeframe, Timeframe::M1);
    }

    #[test]
    fn aggregates_ordered_smallest_to_largest() {
        let mut p =
            CandleProcessor::new(&input(vec![Timeframe::M15, Timeframe::M5]), &config()).unwrap();

        let mut out = Vec::new();
        for i in 0..15 {
            out = p.process(base_candle(BUCKET + i * 60, 7.5, true));
        }
        // The 15th candle closes both the 5m and the 15m buckets.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].timeframe, Timeframe::M1);
        assert_eq!(out[1].timeframe, Timeframe::M5);
        assert_eq!(out[2].timeframe, Timeframe::M15);
        assert_eq!(out[2].count, Some(15));
    }

    #[test]
    fn incompatible_targets_dropped_not_fatal() {
        let input = StreamInput::new(StreamKind::Kline, vec!["BTCUSDT".into()], Timeframe::M3)
            .with_aggregates(vec![Timeframe::M15, Timeframe::M30]);
        // 15m is not a multiple of 3m; 30m is.
        let p = CandleProcessor::new(&input, &config()).unwrap();
        assert_eq!(p.targets(), &[Timeframe::M30]);
    }

    #[test]
    fn aggregation_without_warmup_rejected() {
        let mut cfg = config();
        cfg.active_warmup = false;
        let err = CandleProcessor::new(&input(vec![Timeframe::M5]), &cfg).unwrap_err();
        assert!(matches!(err, ConfigError::WarmupRequired));
    }

    // -- Processor: warmup seeding ----------------------------------------

    #[test]
    fn seed_fills_buffer_silently_by_default() {
        let mut p = CandleProcessor::new(&input(vec![Timeframe::M5]), &config()).unwrap();
        let history: Vec<Candle> = (0..5)
            .map(|i| base_candle(1_700_000_000 + i * 60, 7.5, true))
            .collect();
        let emitted = p.seed("BTCUSDT", history);
        assert!(emitted.is_empty());
        assert_eq!(p.buffer_len("BTCUSDT", Timeframe::M1), 5);
    }

    #[test]
    fn seed_emits_when_configured() {
        let mut cfg = config();
        cfg.emit_warmup = true;
        let mut p = CandleProcessor::new(&input(vec![]), &cfg).unwrap();
        let history: Vec<Candle> = (0..3)
            .map(|i| base_candle(1_700_000_000 + i * 60, 7.5, true))
            .collect();
        let emitted = p.seed("BTCUSDT", history);
        assert_eq!(emitted.len(), 3);
        assert!(emitted.iter().all(|c| c.is_closed));
    }

    #[test]
    fn seeded_history_completes_first_bucket() {
        let mut p = CandleProcessor::new(&input(vec![Timeframe::M5]), &config()).unwrap();
        // Warmup delivers :00 through :03 of the bucket...
        let history: Vec<Candle> = (0..4)
            .map(|i| base_candle(BUCKET + i * 60, 7.5, true))
            .collect();
        p.seed("BTCUSDT", history);
        // ...and the live stream closes it with :04.
        let out = p.process(base_candle(BUCKET + 240, 7.5, true));
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].timeframe, Timeframe::M5);
        assert_eq!(out[1].count, Some(5));
    }

    #[test]
    fn base_buffer_sized_for_largest_target() {
        let p = CandleProcessor::new(&input(vec![Timeframe::H4]), &config()).unwrap();
        // 4h of 1m candles is 240; the ring has to hold a full bucket.
        assert!(p.base_cap >= 240);
    }
}
