use crate::models::*;
use crate::performance::PerformanceCalculator;
use rayon::prelude::*;
use std::collections::HashMap;

type PairKey = (String, String);

struct StitchedSeries {
    symbol: String,
    strategy: String,
    running_capital: Option<f64>,
    equity_curve: Vec<EquityPoint>,
    trades: Vec<Trade>,
}

impl StitchedSeries {
    fn new(symbol: &str, strategy: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
            running_capital: None,
            equity_curve: Vec::new(),
            trades: Vec::new(),
        }
    }

    /// Chain one segment onto the stitched curve. A segment that starts after
    /// the last stitched date is rescaled from its initial capital; one that
    /// overlaps is rescaled from its own value on the last stitched date, so
    /// growth inside the overlap is only counted once.
    fn append(&mut self, result: &StrategyResult) {
        let running = *self.running_capital.get_or_insert(result.initial_capital);
        let stitched_until = self.equity_curve.last().map(|point| point.date);
        let anchor = stitched_until
            .and_then(|last| {
                result
                    .equity_curve
                    .iter()
                    .take_while(|point| point.date <= last)
                    .last()
            })
            .map(|point| point.value)
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(result.initial_capital);
        let scale = if anchor > 0.0 { running / anchor } else { 1.0 };

        let is_new = |date: chrono::NaiveDate| stitched_until.map_or(true, |last| date > last);

        self.equity_curve.extend(
            result
                .equity_curve
                .iter()
                .filter(|point| point.value.is_finite() && is_new(point.date))
                .map(|point| EquityPoint {
                    date: point.date,
                    value: point.value * scale,
                }),
        );
        self.trades.extend(
            result
                .trades
                .iter()
                .filter(|trade| is_new(trade.exit_date))
                .cloned(),
        );

        if let Some(last) = self.equity_curve.last() {
            self.running_capital = Some(last.value);
        }
    }

    fn into_record(self) -> WalkForwardRecord {
        WalkForwardRecord {
            metrics: PerformanceCalculator::compute_metrics(&self.equity_curve),
            trade_stats: PerformanceCalculator::compute_trade_stats(&self.trades),
            symbol: self.symbol,
            strategy: self.strategy,
            equity_curve: self.equity_curve,
            trades: self.trades,
        }
    }
}

fn stitch_slide(segments: &[SegmentResult]) -> Vec<WalkForwardRecord> {
    let mut order: Vec<PairKey> = Vec::new();
    let mut series: HashMap<PairKey, StitchedSeries> = HashMap::new();

    for segment in segments {
        for result in segment.results.iter().filter(|r| !r.is_overall()) {
            let key = (result.symbol.clone(), result.strategy.clone());
            series
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    StitchedSeries::new(&result.symbol, &result.strategy)
                })
                .append(result);
        }
    }

    order
        .into_iter()
        .filter_map(|key| series.remove(&key))
        .map(StitchedSeries::into_record)
        .collect()
}

/// Slide a run of `window_length` consecutive segments across `segments`
/// (already in window-start order) and stitch each run per (symbol, strategy).
///
/// Returns one list of records per slide; fewer segments than `window_length`
/// yields no slides. The synthetic overall curve is not stitched.
pub fn compute_walkforward_results(
    segments: &[SegmentResult],
    window_length: usize,
) -> Vec<Vec<WalkForwardRecord>> {
    if window_length == 0 || segments.len() < window_length {
        return Vec::new();
    }
    segments
        .par_windows(window_length)
        .map(stitch_slide)
        .collect()
}

/// A slide counts as "no trade" when it produced no trades for the pair.
fn is_no_trade(record: &WalkForwardRecord) -> bool {
    record.trade_stats.is_none() || record.trades.is_empty()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Daily returns of the concatenated curve: sorted by date, first value wins
/// on duplicate dates, and the first point (which has no prior) is dropped.
pub fn daily_returns(curve: &[EquityPoint]) -> Option<Vec<DailyReturn>> {
    if curve.is_empty() {
        return None;
    }
    let mut points = curve.to_vec();
    points.sort_by_key(|point| point.date);
    points.dedup_by_key(|point| point.date);

    Some(
        points
            .windows(2)
            .map(|pair| {
                let previous = pair[0].value;
                let change = if previous == 0.0 {
                    0.0
                } else {
                    (pair[1].value - previous) / previous
                };
                DailyReturn {
                    date: pair[1].date,
                    value: pair[1].value,
                    daily_return: if change.is_finite() { change } else { 0.0 },
                }
            })
            .collect(),
    )
}

#[derive(Default)]
struct PairAccumulator {
    segments: usize,
    no_trade_segments: usize,
    sharpe: Vec<f64>,
    cagr: Vec<f64>,
    max_drawdown: Vec<f64>,
    win_rate: Vec<f64>,
    equity_curve: Vec<EquityPoint>,
}

/// Summarise every (symbol, strategy) pair across all slides. Slides without
/// trades are counted but kept out of the averages and the return series.
pub fn aggregate_walkforward_results(slides: &[Vec<WalkForwardRecord>]) -> Vec<AggregatedResult> {
    let mut order: Vec<PairKey> = Vec::new();
    let mut pairs: HashMap<PairKey, PairAccumulator> = HashMap::new();

    for record in slides.iter().flatten() {
        let key = (record.symbol.clone(), record.strategy.clone());
        let acc = pairs.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            PairAccumulator::default()
        });
        acc.segments += 1;

        if is_no_trade(record) {
            acc.no_trade_segments += 1;
            continue;
        }
        if let Some(metrics) = &record.metrics {
            acc.sharpe.push(metrics.sharpe_ratio);
            acc.cagr.push(metrics.cagr);
            acc.max_drawdown.push(metrics.max_drawdown);
        }
        if let Some(stats) = &record.trade_stats {
            acc.win_rate.push(stats.win_rate);
        }
        acc.equity_curve.extend(record.equity_curve.iter().copied());
    }

    order
        .into_iter()
        .filter_map(|key| pairs.remove(&key).map(|acc| (key, acc)))
        .map(|((symbol, strategy), acc)| AggregatedResult {
            symbol,
            strategy,
            segments: acc.segments,
            active_segments: acc.segments - acc.no_trade_segments,
            no_trade_segments: acc.no_trade_segments,
            avg_sharpe: mean(&acc.sharpe),
            avg_cagr: mean(&acc.cagr),
            avg_max_drawdown: mean(&acc.max_drawdown),
            avg_win_rate: mean(&acc.win_rate),
            returns: daily_returns(&acc.equity_curve),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Duration::days(offset)
    }

    fn trade(exit_offset: i64, pnl: f64) -> Trade {
        Trade {
            symbol: "AAA".to_string(),
            direction: TradeDirection::Long,
            entry_date: day(exit_offset - 1),
            exit_date: day(exit_offset),
            entry_price: 10.0,
            exit_price: 10.0 + pnl,
            quantity: 1.0,
            pnl,
            return_pct: pnl * 10.0,
            costs: 0.0,
        }
    }

    fn result(
        symbol: &str,
        first_day: i64,
        values: &[f64],
        trades: Vec<Trade>,
    ) -> StrategyResult {
        let equity_curve: Vec<EquityPoint> = values
            .iter()
            .enumerate()
            .map(|(i, &value)| EquityPoint {
                date: day(first_day + i as i64),
                value,
            })
            .collect();
        StrategyResult {
            key: format!("{}_momentum", symbol),
            symbol: symbol.to_string(),
            strategy: "momentum".to_string(),
            initial_capital: 100.0,
            final_capital: equity_curve.last().map(|p| p.value),
            return_pct: None,
            metrics: PerformanceCalculator::compute_metrics(&equity_curve),
            trade_stats: PerformanceCalculator::compute_trade_stats(&trades),
            equity_curve,
            trades,
        }
    }

    fn overall(first_day: i64) -> StrategyResult {
        StrategyResult {
            key: OVERALL_KEY.to_string(),
            symbol: OVERALL_KEY.to_string(),
            strategy: OVERALL_KEY.to_string(),
            ..result("X", first_day, &[100.0, 100.0], Vec::new())
        }
    }

    fn segment(id: usize, results: Vec<StrategyResult>) -> SegmentResult {
        SegmentResult {
            window: Window {
                id,
                start: day(id as i64 * 10),
                end: day(id as i64 * 10 + 9),
            },
            results,
        }
    }

    fn segments() -> Vec<SegmentResult> {
        vec![
            segment(
                0,
                vec![
                    result("AAA", 0, &[100.0, 110.0, 120.0], vec![trade(2, 2.0)]),
                    result("BBB", 0, &[100.0, 100.0, 100.0], Vec::new()),
                    overall(0),
                ],
            ),
            segment(
                1,
                vec![
                    result("AAA", 10, &[100.0, 90.0, 150.0], vec![trade(12, 5.0)]),
                    result("BBB", 10, &[100.0, 100.0, 100.0], Vec::new()),
                    overall(10),
                ],
            ),
            segment(
                2,
                vec![
                    result("AAA", 20, &[100.0, 100.0, 100.0], Vec::new()),
                    result("BBB", 20, &[100.0, 105.0, 110.0], vec![trade(22, 1.0)]),
                    overall(20),
                ],
            ),
        ]
    }

    #[test]
    fn segments_chain_on_running_capital() {
        let slides = compute_walkforward_results(&segments(), 2);
        assert_eq!(slides.len(), 2);

        let aaa = &slides[0][0];
        assert_eq!(aaa.symbol, "AAA");
        let expected = [100.0, 110.0, 120.0, 120.0, 108.0, 180.0];
        assert_eq!(aaa.equity_curve.len(), expected.len());
        for (point, value) in aaa.equity_curve.iter().zip(expected) {
            assert!((point.value - value).abs() < 1e-9);
        }
        assert_eq!(aaa.trades.len(), 2);
        assert!(slides.iter().flatten().all(|r| r.symbol != OVERALL_KEY));
    }

    #[test]
    fn overlapping_dates_are_not_repeated() {
        let mut overlapping = segments();
        overlapping[1].results[0] = result("AAA", 2, &[100.0, 90.0], vec![trade(2, 2.0), trade(3, 1.0)]);
        let slides = compute_walkforward_results(&overlapping[..2], 2);
        let aaa = &slides[0][0];
        let dates: Vec<NaiveDate> = aaa.equity_curve.iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![day(0), day(1), day(2), day(3)]);
        assert!((aaa.equity_curve[3].value - 108.0).abs() < 1e-9);
        // The day-2 trade was already stitched from the first segment.
        assert_eq!(aaa.trades.len(), 2);
    }

    #[test]
    fn overlap_growth_is_counted_once() {
        // Both segments track a market rising 10% a day and share days 1 and 2.
        let rising = vec![
            segment(0, vec![result("AAA", 0, &[100.0, 110.0, 121.0], vec![trade(2, 1.0)])]),
            segment(1, vec![result("AAA", 1, &[100.0, 110.0, 121.0], vec![trade(3, 1.0)])]),
        ];
        let slides = compute_walkforward_results(&rising, 2);
        let values: Vec<f64> = slides[0][0].equity_curve.iter().map(|p| p.value).collect();
        let expected = [100.0, 110.0, 121.0, 133.1];
        assert_eq!(values.len(), expected.len());
        for (value, want) in values.iter().zip(expected) {
            assert!((value - want).abs() < 1e-9, "{} != {}", value, want);
        }
    }

    #[test]
    fn stitching_is_idempotent() {
        let input = segments();
        assert_eq!(
            compute_walkforward_results(&input, 2),
            compute_walkforward_results(&input, 2)
        );
        assert!(compute_walkforward_results(&input, 4).is_empty());
        assert!(compute_walkforward_results(&input, 0).is_empty());
    }

    #[test]
    fn aggregation_separates_no_trade_slides() {
        let slides = compute_walkforward_results(&segments(), 1);
        let aggregated = aggregate_walkforward_results(&slides);
        assert_eq!(aggregated.len(), 2);
        for pair in &aggregated {
            assert_eq!(pair.active_segments + pair.no_trade_segments, pair.segments);
            assert_eq!(pair.segments, 3);
        }

        let aaa = &aggregated[0];
        assert_eq!(aaa.symbol, "AAA");
        assert_eq!(aaa.active_segments, 2);
        assert_eq!(aaa.avg_win_rate, Some(100.0));
        let bbb = &aggregated[1];
        assert_eq!(bbb.no_trade_segments, 2);
        let returns = bbb.returns.as_ref().unwrap();
        assert_eq!(returns.len(), 2);
        assert!((returns[0].daily_return - 0.05).abs() < 1e-12);
    }

    #[test]
    fn pair_without_any_trades_has_no_averages() {
        let slides = vec![vec![WalkForwardRecord {
            symbol: "CCC".to_string(),
            strategy: "breakout".to_string(),
            equity_curve: Vec::new(),
            trades: Vec::new(),
            metrics: None,
            trade_stats: None,
        }]];
        let aggregated = aggregate_walkforward_results(&slides);
        assert_eq!(aggregated[0].avg_sharpe, None);
        assert_eq!(aggregated[0].returns, None);
        assert_eq!(aggregated[0].active_segments, 0);
    }

    #[test]
    fn returns_guard_zero_values_and_duplicates() {
        let curve = vec![
            EquityPoint { date: day(1), value: 0.0 },
            EquityPoint { date: day(0), value: 50.0 },
            EquityPoint { date: day(1), value: 99.0 },
            EquityPoint { date: day(2), value: 10.0 },
        ];
        let returns = daily_returns(&curve).unwrap();
        assert_eq!(returns.len(), 2);
        assert_eq!(returns[0].value, 0.0);
        assert_eq!(returns[0].daily_return, -1.0);
        assert_eq!(returns[1].daily_return, 0.0);
    }
}
