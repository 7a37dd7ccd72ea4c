use crate::models::*;
use statrs::statistics::Statistics;
use std::cmp::Ordering;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
pub const RISK_FREE_RATE: f64 = 0.01;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Bar-to-bar returns; steps from a zero value are skipped.
    pub fn daily_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .filter(|window| window[0].value != 0.0)
            .map(|window| (window[1].value - window[0].value) / window[0].value)
            .filter(|value| value.is_finite())
            .collect()
    }

    /// Risk/return summary of an equity curve, `None` when it has fewer than two usable points.
    ///
    /// `cagr` and `max_drawdown` are percentages; `mean_return` and
    /// `annualised_volatility` are annualised fractions.
    pub fn compute_metrics(equity_curve: &[EquityPoint]) -> Option<PerformanceMetrics> {
        let returns = Self::daily_returns(equity_curve);
        if returns.is_empty() {
            return None;
        }

        let periods = returns.len() as f64;
        let mean_daily = returns.iter().mean();
        let std_daily = returns.iter().population_std_dev();
        let std_daily = if std_daily.is_finite() { std_daily } else { 0.0 };

        let mean_annual = mean_daily * TRADING_DAYS_PER_YEAR;
        let start_value = equity_curve.first().map(|p| p.value).unwrap_or(0.0);
        let final_value = equity_curve.last().map(|p| p.value).unwrap_or(0.0);
        let cagr = Self::calculate_cagr(start_value, final_value, periods);

        let annualised_volatility = std_daily * TRADING_DAYS_PER_YEAR.sqrt();
        let sharpe_ratio = if annualised_volatility > 0.0 {
            (mean_annual - RISK_FREE_RATE) / annualised_volatility
        } else {
            0.0
        };

        Some(PerformanceMetrics {
            mean_return: mean_annual,
            cagr: cagr * 100.0,
            annualised_volatility,
            sharpe_ratio,
            max_drawdown: Self::calculate_max_drawdown(equity_curve) * 100.0,
        })
    }

    fn calculate_cagr(start_value: f64, final_value: f64, periods: f64) -> f64 {
        if start_value <= 0.0 || final_value <= 0.0 || !final_value.is_finite() || periods <= 0.0
        {
            return 0.0;
        }
        let cagr = (final_value / start_value).powf(TRADING_DAYS_PER_YEAR / periods) - 1.0;
        if cagr.is_finite() {
            cagr
        } else {
            0.0
        }
    }

    /// Largest peak-to-trough decline as a fraction of the running peak.
    pub fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
        let Some(first) = equity_curve.first() else {
            return 0.0;
        };

        let mut peak = first.value;
        let mut max_drawdown = 0.0_f64;
        for point in equity_curve {
            peak = peak.max(point.value);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - point.value) / peak);
            }
        }
        max_drawdown
    }

    /// Win/loss breakdown of completed trades, `None` without trades.
    ///
    /// Wins and losses are measured per share (`returnPct · entryPrice`), so
    /// position size does not dominate the averages.
    pub fn compute_trade_stats(trades: &[Trade]) -> Option<TradeStats> {
        let first = trades.first()?;

        let mut total_win = 0.0;
        let mut total_loss = 0.0;
        let mut wins = 0usize;
        let mut losses = 0usize;
        for trade in trades {
            let per_share = trade.return_pct / 100.0 * trade.entry_price;
            if trade.return_pct > 0.0 {
                wins += 1;
                total_win += per_share;
            } else {
                losses += 1;
                total_loss += per_share.abs();
            }
        }

        let by_pnl = |a: &&Trade, b: &&Trade| a.pnl.partial_cmp(&b.pnl).unwrap_or(Ordering::Equal);
        let best_trade = trades.iter().max_by(by_pnl).unwrap_or(first).clone();
        let worst_trade = trades.iter().min_by(by_pnl).unwrap_or(first).clone();

        Some(TradeStats {
            num_trades: trades.len(),
            win_rate: wins as f64 / trades.len() as f64 * 100.0,
            avg_win: if wins > 0 { total_win / wins as f64 } else { 0.0 },
            avg_loss: if losses > 0 {
                -total_loss / losses as f64
            } else {
                0.0
            },
            profit_factor: if total_loss > 0.0 {
                Some(total_win / total_loss)
            } else {
                None
            },
            best_trade,
            worst_trade,
        })
    }
}
