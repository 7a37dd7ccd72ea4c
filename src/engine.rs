use crate::config::{BacktestSettings, FillTiming};
use crate::error::{EngineError, EngineResult};
use crate::indicators::estimate_annualized_volatility;
use crate::ledger::PositionLedger;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::request::StrategyKey;
use crate::strategy::{PriceHistory, SignalEngine};
use chrono::NaiveDate;
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;

/// Closes visible to one key, indexed by the key's own bar count. Pair keys
/// only keep dates where both legs traded.
struct KeySeries {
    index_by_date: HashMap<NaiveDate, usize>,
    closes: Vec<Vec<f64>>,
}

impl KeySeries {
    fn build(key: &StrategyKey, data: &HashMap<String, Vec<PriceBar>>) -> Self {
        let per_leg: Vec<HashMap<NaiveDate, f64>> = key
            .legs
            .iter()
            .map(|symbol| {
                data.get(symbol)
                    .map(|bars| {
                        bars.iter()
                            .filter(|bar| bar.has_price())
                            .map(|bar| (bar.date, bar.close))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        let mut dates: Vec<NaiveDate> = per_leg
            .first()
            .map(|prices| {
                prices
                    .keys()
                    .filter(|date| per_leg.iter().all(|leg| leg.contains_key(date)))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        dates.sort_unstable();

        let closes = per_leg
            .iter()
            .map(|prices| dates.iter().map(|date| prices[date]).collect())
            .collect();
        let index_by_date = dates
            .iter()
            .enumerate()
            .map(|(index, date)| (*date, index))
            .collect();

        Self {
            index_by_date,
            closes,
        }
    }

    fn history(&self) -> PriceHistory<'_> {
        match self.closes.as_slice() {
            [first, second] => PriceHistory::Pair { first, second },
            [single, ..] => PriceHistory::Single(single),
            [] => PriceHistory::Single(&[]),
        }
    }

    /// Own-series index and leg prices on `date`, if every leg traded.
    fn on(&self, date: &NaiveDate) -> Option<(usize, Vec<f64>)> {
        let index = *self.index_by_date.get(date)?;
        Some((index, self.closes.iter().map(|leg| leg[index]).collect()))
    }
}

struct KeyState<'a> {
    key: &'a StrategyKey,
    series: KeySeries,
    ledger: PositionLedger,
    last_prices: Vec<Option<f64>>,
    pending: SignalAction,
    equity_curve: Vec<EquityPoint>,
}

/// Drives the shared bar loop for one window across every strategy key.
pub struct BacktestRunner<'a> {
    keys: &'a [StrategyKey],
    settings: &'a BacktestSettings,
}

impl<'a> BacktestRunner<'a> {
    pub fn new(keys: &'a [StrategyKey], settings: &'a BacktestSettings) -> Self {
        Self { keys, settings }
    }

    pub fn run(
        &self,
        data: &HashMap<String, Vec<PriceBar>>,
        trading_start: Option<NaiveDate>,
        lookback: usize,
    ) -> EngineResult<Vec<StrategyResult>> {
        self.run_with_progress(data, trading_start, lookback, |_, _| ControlFlow::Continue(()))
    }

    /// Run the window. Trading and marking begin at the first date on or after
    /// `trading_start`, or after `lookback` bars when no start is given.
    /// `on_bar(done, total)` is called after every bar; returning `Break` cancels the run.
    pub fn run_with_progress<F>(
        &self,
        data: &HashMap<String, Vec<PriceBar>>,
        trading_start: Option<NaiveDate>,
        lookback: usize,
        mut on_bar: F,
    ) -> EngineResult<Vec<StrategyResult>>
    where
        F: FnMut(usize, usize) -> ControlFlow<()>,
    {
        let all_dates: Vec<NaiveDate> = self
            .keys
            .iter()
            .flat_map(|key| key.legs.iter())
            .filter_map(|symbol| data.get(symbol))
            .flatten()
            .map(|bar| bar.date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let first_trading_index = match trading_start {
            Some(start) => all_dates.partition_point(|date| *date < start),
            None => lookback,
        };

        let costs = self.settings.trading_costs();
        let mut states: Vec<KeyState> = self
            .keys
            .iter()
            .map(|key| KeyState {
                key,
                series: KeySeries::build(key, data),
                ledger: PositionLedger::new(
                    key.legs.clone(),
                    key.weight * self.settings.initial_capital,
                    costs,
                    self.settings.min_holding_period,
                ),
                last_prices: vec![None; key.legs.len()],
                pending: SignalAction::Hold,
                equity_curve: Vec::new(),
            })
            .collect();
        let mut overall_curve = Vec::new();

        let total = all_dates.len();
        for (idx, date) in all_dates.iter().enumerate() {
            for state in states.iter_mut() {
                let today = state.series.on(date);
                if let Some((_, prices)) = &today {
                    for (slot, price) in state.last_prices.iter_mut().zip(prices) {
                        *slot = Some(*price);
                    }
                }

                let raw = if idx >= first_trading_index {
                    raw_signal(state, today.as_ref(), date)
                } else {
                    SignalAction::Hold
                };

                match self.settings.fill_timing {
                    FillTiming::SameBar => {
                        state.pending = state.ledger.filter_signal(raw, idx);
                        self.fill_pending(state, today.as_ref(), idx, date)?;
                    }
                    FillTiming::NextBar => {
                        // Yesterday's order fills first so today's signal is gated on the new position.
                        self.fill_pending(state, today.as_ref(), idx, date)?;
                        state.pending = state.ledger.filter_signal(raw, idx);
                    }
                }
            }

            if idx >= first_trading_index {
                let mut overall = 0.0;
                for state in states.iter_mut() {
                    let value = mark(state);
                    overall += value;
                    state.equity_curve.push(EquityPoint { date: *date, value });
                }
                overall_curve.push(EquityPoint {
                    date: *date,
                    value: overall,
                });
            }

            if let ControlFlow::Break(()) = on_bar(idx + 1, total) {
                return Err(EngineError::Cancelled);
            }
        }

        Ok(self.collect_results(states, overall_curve))
    }

    /// Apply the queued action at today's prices; exits run before entries.
    fn fill_pending(
        &self,
        state: &mut KeyState,
        today: Option<&(usize, Vec<f64>)>,
        idx: usize,
        date: &NaiveDate,
    ) -> EngineResult<()> {
        let action = std::mem::replace(&mut state.pending, SignalAction::Hold);
        if action == SignalAction::Hold {
            return Ok(());
        }
        let Some((series_index, prices)) = today else {
            debug!(
                "{} dropped {:?} on {}: no price to fill at",
                state.key.id, action, date
            );
            return Ok(());
        };

        if action.is_exit() && !state.ledger.is_flat() {
            state.ledger.close(prices, *date)?;
        }
        if action.is_entry() && state.ledger.is_flat() {
            let fraction = self.entry_fraction(&state.series, *series_index);
            state.ledger.open(action, prices, idx, *date, fraction)?;
        }
        Ok(())
    }

    /// Share of available capital to commit, scaled down to meet the volatility target.
    fn entry_fraction(&self, series: &KeySeries, series_index: usize) -> f64 {
        let Some(target) = self.settings.vol_target_fraction() else {
            return 1.0;
        };
        let realised = series
            .closes
            .iter()
            .map(|closes| {
                estimate_annualized_volatility(closes, series_index, self.settings.vol_lookback)
            })
            .fold(0.0_f64, f64::max);
        if realised > 0.0 {
            (target / realised).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    fn collect_results(
        &self,
        states: Vec<KeyState>,
        overall_curve: Vec<EquityPoint>,
    ) -> Vec<StrategyResult> {
        let mut results = Vec::with_capacity(states.len() + 1);
        let mut all_trades = Vec::new();
        let mut overall_capital = 0.0;

        for state in states {
            let initial_capital = state.key.weight * self.settings.initial_capital;
            overall_capital += initial_capital;
            let trades = state.ledger.into_trades();
            all_trades.extend(trades.iter().cloned());
            results.push(build_result(
                state.key.id.clone(),
                state.key.symbol.clone(),
                state.key.strategy.name().to_string(),
                initial_capital,
                state.equity_curve,
                trades,
            ));
        }

        results.push(build_result(
            OVERALL_KEY.to_string(),
            OVERALL_KEY.to_string(),
            OVERALL_KEY.to_string(),
            overall_capital,
            overall_curve,
            all_trades,
        ));
        results
    }
}

fn raw_signal(
    state: &KeyState,
    today: Option<&(usize, Vec<f64>)>,
    date: &NaiveDate,
) -> SignalAction {
    let Some((series_index, _)) = today else {
        debug!("{} has no price on {}; holding", state.key.id, date);
        return SignalAction::Hold;
    };
    state
        .key
        .strategy
        .evaluate(&state.series.history(), *series_index)
}

/// Frictionless liquidation value at the latest known prices.
fn mark(state: &KeyState) -> f64 {
    if state.ledger.is_flat() {
        return state.ledger.cash();
    }
    let prices: Vec<f64> = state
        .last_prices
        .iter()
        .map(|price| price.unwrap_or(0.0))
        .collect();
    state.ledger.mark_to_market(&prices)
}

fn build_result(
    key: String,
    symbol: String,
    strategy: String,
    initial_capital: f64,
    equity_curve: Vec<EquityPoint>,
    trades: Vec<Trade>,
) -> StrategyResult {
    let final_capital = equity_curve.last().map(|point| point.value);
    let return_pct = final_capital.map(|value| {
        if initial_capital > 0.0 {
            (value / initial_capital - 1.0) * 100.0
        } else {
            0.0
        }
    });
    StrategyResult {
        key,
        symbol,
        strategy,
        initial_capital,
        final_capital,
        return_pct,
        metrics: PerformanceCalculator::compute_metrics(&equity_curve),
        trade_stats: PerformanceCalculator::compute_trade_stats(&trades),
        equity_curve,
        trades,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BacktestRequest;
    use chrono::Duration;
    use serde_json::json;

    fn bars(symbol: &str, start: NaiveDate, closes: &[f64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PriceBar {
                symbol: symbol.to_string(),
                date: start + Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1_000.0,
            })
            .collect()
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn sma_request(settings: serde_json::Value) -> (Vec<StrategyKey>, BacktestSettings) {
        let request: BacktestRequest = serde_json::from_value(json!({
            "startDate": "2024-01-01",
            "endDate": "2024-01-05",
            "symbols": [{"symbol": "AAA", "strategy": "sma_crossover", "weight": 1.0}],
            "strategyParams": {"sma_crossover": {"shortPeriod": 1, "longPeriod": 2}},
            "settings": settings
        }))
        .unwrap();
        let keys = request.prepare_strategy_keys().unwrap();
        (keys, request.settings)
    }

    #[test]
    fn sma_crossover_round_trip_without_costs() {
        let (keys, settings) = sma_request(json!({"initialCapital": 1000}));
        let mut data = HashMap::new();
        data.insert(
            "AAA".to_string(),
            bars("AAA", start(), &[10.0, 11.0, 12.0, 11.0, 10.0]),
        );

        let results = BacktestRunner::new(&keys, &settings)
            .run(&data, None, 0)
            .unwrap();
        let key = &results[0];
        assert_eq!(key.trades.len(), 1);
        let trade = &key.trades[0];
        assert_eq!(trade.entry_price, 11.0);
        assert_eq!(trade.exit_price, 10.0);
        assert!((trade.return_pct + 100.0 / 11.0).abs() < 1e-9);
        assert_eq!(trade.entry_date, start() + Duration::days(3));
        assert_eq!(trade.exit_date, start() + Duration::days(4));

        let final_capital = key.final_capital.unwrap();
        assert!((final_capital - 1000.0 * 10.0 / 11.0).abs() < 1e-9);
        assert_eq!(key.equity_curve.len(), 5);
        assert!(results.last().unwrap().is_overall());
    }

    #[test]
    fn vol_target_scales_the_entry_budget() {
        let (keys, settings) = sma_request(json!({
            "initialCapital": 1000,
            "volTarget": 50,
            "volLookback": 3
        }));
        let mut data = HashMap::new();
        data.insert(
            "AAA".to_string(),
            bars("AAA", start(), &[10.0, 11.0, 12.0, 11.0, 10.0]),
        );

        // Fill bar is index 3; its three-bar lookback holds the returns into bars 1..=3.
        let returns = [1.0 / 10.0, 1.0 / 11.0, -1.0 / 12.0];
        let mean = returns.iter().sum::<f64>() / 3.0;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / 2.0;
        let realised = variance.sqrt() * 252.0_f64.sqrt();
        let fraction = 0.5 / realised;
        assert!(fraction > 0.0 && fraction < 1.0);

        let results = BacktestRunner::new(&keys, &settings)
            .run(&data, None, 0)
            .unwrap();
        let key = &results[0];
        let trade = &key.trades[0];
        assert_eq!(trade.entry_date, start() + Duration::days(3));
        let budget = 1000.0 * fraction;
        assert!((trade.quantity - budget / 11.0).abs() < 1e-9);

        // Uninvested cash rides through the trade untouched.
        let final_capital = key.final_capital.unwrap();
        let cash = final_capital - trade.quantity * trade.exit_price;
        assert!((cash - (1000.0 - budget)).abs() < 1e-9);
        assert!((key.equity_curve[3].value - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn same_bar_fills_at_signal_close() {
        let (keys, settings) = sma_request(json!({"initialCapital": 1000, "fillTiming": "sameBar"}));
        let mut data = HashMap::new();
        data.insert(
            "AAA".to_string(),
            bars("AAA", start(), &[10.0, 11.0, 12.0, 11.0, 10.0]),
        );
        let results = BacktestRunner::new(&keys, &settings)
            .run(&data, None, 0)
            .unwrap();
        let trade = &results[0].trades[0];
        assert_eq!(trade.entry_price, 12.0);
        assert_eq!(trade.exit_price, 11.0);
    }

    #[test]
    fn missing_bar_holds_and_carries_equity_forward() {
        let request: BacktestRequest = serde_json::from_value(json!({
            "startDate": "2024-01-01",
            "endDate": "2024-01-10",
            "symbols": [
                {"symbol": "AAA", "strategy": "momentum", "weight": 0.5},
                {"symbol": "BBB", "strategy": "momentum", "weight": 0.5}
            ],
            "strategyParams": {"momentum": {"lookback": 1}},
            "settings": {"initialCapital": 2000}
        }))
        .unwrap();
        let keys = request.prepare_strategy_keys().unwrap();

        let mut aaa = bars("AAA", start(), &[10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        aaa.remove(3);
        let mut data = HashMap::new();
        data.insert("AAA".to_string(), aaa);
        data.insert(
            "BBB".to_string(),
            bars("BBB", start(), &[20.0, 20.0, 20.0, 20.0, 20.0, 20.0]),
        );

        let results = BacktestRunner::new(&keys, &request.settings)
            .run(&data, None, 0)
            .unwrap();
        let aaa_curve = &results[0].equity_curve;
        assert_eq!(aaa_curve.len(), 6);
        // Day 4 has no AAA bar: its value repeats day 3's mark.
        assert_eq!(aaa_curve[3].value, aaa_curve[2].value);
        assert_eq!(aaa_curve[3].date, start() + Duration::days(3));

        let overall = &results[2].equity_curve;
        for (i, point) in overall.iter().enumerate() {
            let sum = results[0].equity_curve[i].value + results[1].equity_curve[i].value;
            assert!((point.value - sum).abs() < 1e-9);
        }
    }

    #[test]
    fn flat_final_capital_reconciles_with_trades_and_costs() {
        let request: BacktestRequest = serde_json::from_value(json!({
            "startDate": "2024-01-01",
            "endDate": "2024-03-01",
            "symbols": [{"symbol": "AAA", "strategy": "momentum"}],
            "strategyParams": {"momentum": {"lookback": 2}},
            "settings": {
                "initialCapital": 10000,
                "slippage": 0.1,
                "transactionCostPct": 0.1,
                "fixedTransactionCost": 1.0
            }
        }))
        .unwrap();
        let keys = request.prepare_strategy_keys().unwrap();
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + 10.0 * ((i as f64) * 0.7).sin())
            .collect();
        let mut closes_flat_end = closes.clone();
        // Three falling closes at the end force a final exit.
        closes_flat_end.extend([80.0, 70.0, 60.0, 50.0]);
        let mut data = HashMap::new();
        data.insert("AAA".to_string(), bars("AAA", start(), &closes_flat_end));

        let results = BacktestRunner::new(&keys, &request.settings)
            .run(&data, None, 0)
            .unwrap();
        let key = &results[0];
        assert!(key.trades.len() > 1);
        let pnl: f64 = key.trades.iter().map(|t| t.pnl).sum();
        let costs: f64 = key.trades.iter().map(|t| t.costs).sum();
        let final_capital = key.final_capital.unwrap();
        assert!((final_capital - 10_000.0 - (pnl - costs)).abs() < 1e-6);
    }

    #[test]
    fn trading_start_skips_lookback_bars() {
        let (keys, settings) = sma_request(json!({"initialCapital": 1000}));
        let mut data = HashMap::new();
        data.insert(
            "AAA".to_string(),
            bars("AAA", start(), &[10.0, 11.0, 12.0, 11.0, 10.0]),
        );
        let results = BacktestRunner::new(&keys, &settings)
            .run(&data, Some(start() + Duration::days(2)), 0)
            .unwrap();
        assert_eq!(results[0].equity_curve.len(), 3);
        assert_eq!(results[0].equity_curve[0].date, start() + Duration::days(2));
        assert_eq!(results[0].equity_curve[0].value, 1000.0);
    }

    #[test]
    fn progress_callback_can_cancel() {
        let (keys, settings) = sma_request(json!({}));
        let mut data = HashMap::new();
        data.insert(
            "AAA".to_string(),
            bars("AAA", start(), &[10.0, 11.0, 12.0, 11.0, 10.0]),
        );
        let mut seen = Vec::new();
        let outcome = BacktestRunner::new(&keys, &settings).run_with_progress(
            &data,
            None,
            0,
            |done, total| {
                seen.push((done, total));
                if done == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        assert!(matches!(outcome, Err(EngineError::Cancelled)));
        assert_eq!(seen, vec![(1, 5), (2, 5)]);
    }

    #[test]
    fn pairs_trade_on_aligned_dates_only() {
        let request: BacktestRequest = serde_json::from_value(json!({
            "startDate": "2024-01-01",
            "endDate": "2024-01-10",
            "symbols": [{"symbol": "AAA-BBB", "strategy": "pairs_trading"}],
            "strategyParams": {"pairs_trading": {"lookback": 4, "entryZ": 1.5, "exitZ": 0.5}},
            "settings": {"initialCapital": 1000, "fillTiming": "sameBar"}
        }))
        .unwrap();
        let keys = request.prepare_strategy_keys().unwrap();
        let spreads = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 5.0, 1.75];
        let first: Vec<f64> = spreads.iter().map(|s| 100.0 + s).collect();
        let mut data = HashMap::new();
        data.insert("AAA".to_string(), bars("AAA", start(), &first));
        data.insert("BBB".to_string(), bars("BBB", start(), &[100.0; 8]));

        let results = BacktestRunner::new(&keys, &request.settings)
            .run(&data, None, 0)
            .unwrap();
        let trades = &results[0].trades;
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].direction, TradeDirection::Short);
        assert_eq!(trades[0].entry_date, start() + Duration::days(6));
        assert_eq!(trades[0].exit_date, start() + Duration::days(7));
        assert_eq!(trades[1].direction, TradeDirection::Long);
    }
}
