/// Mean of the `period` values ending at `index`; `None` until the window fills.
pub fn sma_at(prices: &[f64], period: usize, index: usize) -> Option<f64> {
    if period == 0 || index >= prices.len() || index + 1 < period {
        return None;
    }
    let window = &prices[index + 1 - period..=index];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the SMA of the first full run of `period` defined values.
/// Later gaps stay `None` and do not reset the running average.
pub fn calculate_ema(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut ema_values = Vec::with_capacity(values.len());
    if period == 0 {
        return vec![None; values.len()];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut previous: Option<f64> = None;
    for (i, value) in values.iter().enumerate() {
        let Some(value) = *value else {
            ema_values.push(None);
            continue;
        };

        previous = match previous {
            Some(prev) => Some(value * multiplier + prev * (1.0 - multiplier)),
            None if i + 1 < period => None,
            None => {
                let window = &values[i + 1 - period..=i];
                if window.iter().any(Option::is_none) {
                    None
                } else {
                    Some(window.iter().flatten().sum::<f64>() / period as f64)
                }
            }
        };
        ema_values.push(previous);
    }

    ema_values
}

/// Wilder-smoothed RSI. The first `period` entries are `None`.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rsi_values = vec![None; prices.len()];
    if period == 0 || prices.len() <= period {
        return rsi_values;
    }

    let delta = |i: usize| if i == 0 { 0.0 } else { prices[i] - prices[i - 1] };

    let mut avg_gain = (0..period).map(|i| delta(i).max(0.0)).sum::<f64>() / period as f64;
    let mut avg_loss = (0..period).map(|i| (-delta(i)).max(0.0)).sum::<f64>() / period as f64;

    for (i, slot) in rsi_values.iter_mut().enumerate().skip(period) {
        let change = delta(i);
        avg_gain = (avg_gain * (period as f64 - 1.0) + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + (-change).max(0.0)) / period as f64;
        *slot = Some(rsi_from_avgs(avg_gain, avg_loss));
    }

    rsi_values
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return 50.0;
        }
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Mean and population standard deviation of a slice.
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.max(0.0).sqrt()))
}

/// (lower, middle, upper) Bollinger bands over the `period` closes ending at `index`.
pub fn bollinger_at(
    prices: &[f64],
    period: usize,
    multiplier: f64,
    index: usize,
) -> Option<(f64, f64, f64)> {
    if period == 0 || index >= prices.len() || index + 1 < period {
        return None;
    }
    let (mean, std) = mean_and_std(&prices[index + 1 - period..=index])?;
    Some((mean - multiplier * std, mean, mean + multiplier * std))
}

/// Annualised sample volatility of the daily returns in the `lookback` bars ending at `index`.
pub fn estimate_annualized_volatility(prices: &[f64], index: usize, lookback: usize) -> f64 {
    if index == 0 || lookback < 2 || index >= prices.len() {
        return 0.0;
    }

    let start = index.saturating_sub(lookback - 1).max(1);
    let returns: Vec<f64> = (start..=index)
        .filter(|&i| prices[i - 1] > 0.0)
        .map(|i| (prices[i] - prices[i - 1]) / prices[i - 1])
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|value| {
            let diff = value - mean;
            diff * diff
        })
        .sum::<f64>()
        / (returns.len() as f64 - 1.0);

    let daily_std_dev = variance.max(0.0).sqrt();
    daily_std_dev * 252.0_f64.sqrt()
}
