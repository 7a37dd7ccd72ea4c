use crate::error::{EngineError, EngineResult};
use crate::models::{SignalAction, Trade, TradeDirection};
use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// Slippage and commission as fractions (0.001 == 0.1%).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TradingCosts {
    pub slippage: f64,
    pub commission_pct: f64,
    pub commission_fixed: f64,
}

impl TradingCosts {
    pub const FRICTIONLESS: TradingCosts = TradingCosts {
        slippage: 0.0,
        commission_pct: 0.0,
        commission_fixed: 0.0,
    };
}

/// Price actually paid or received once slippage is applied.
pub fn effective_price(price: f64, slippage: f64, side: Side) -> f64 {
    match side {
        Side::Buy => price * (1.0 + slippage),
        Side::Sell => price * (1.0 - slippage),
    }
}

/// Commission for one fill.
///
/// Buys are charged on the capital committed, scaled so that the commission
/// and the shares it leaves room for add up to `capital`. Sells are charged
/// on the notional of `quantity` at `price`.
pub fn commission(side: Side, capital: f64, price: f64, quantity: f64, pct: f64, fixed: f64) -> f64 {
    match side {
        Side::Buy => (capital * pct + fixed) / (1.0 + pct),
        Side::Sell => quantity.abs() * price * pct + fixed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Flat,
    Long,
    Short,
    PairLong,
    PairShort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub symbol: String,
    /// Signed share count; negative for a short leg.
    pub quantity: f64,
    pub entry_price: f64,
    pub effective_entry: f64,
    pub entry_commission: f64,
}

impl Leg {
    fn closing_side(&self) -> Side {
        if self.quantity > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Cash returned by closing this leg at `price` under `costs`, and the commission paid.
    fn closing_flow(&self, price: f64, costs: &TradingCosts) -> (f64, f64, f64) {
        let side = self.closing_side();
        let effective_exit = effective_price(price, costs.slippage, side);
        let fee = match side {
            Side::Sell => commission(
                side,
                0.0,
                effective_exit,
                self.quantity,
                costs.commission_pct,
                costs.commission_fixed,
            ),
            Side::Buy => commission(
                side,
                self.quantity.abs() * effective_exit,
                effective_exit,
                self.quantity,
                costs.commission_pct,
                costs.commission_fixed,
            ),
        };
        (self.quantity * effective_exit - fee, effective_exit, fee)
    }
}

/// Capital, open legs and completed trades for one strategy key.
///
/// Only the ledger mutates this state; at most one position is open at a time.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    symbols: Vec<String>,
    cash: f64,
    state: LedgerState,
    legs: Vec<Leg>,
    entry_index: Option<usize>,
    entry_date: Option<NaiveDate>,
    min_holding_period: usize,
    costs: TradingCosts,
    trades: Vec<Trade>,
}

impl PositionLedger {
    pub fn new(
        symbols: Vec<String>,
        capital: f64,
        costs: TradingCosts,
        min_holding_period: usize,
    ) -> Self {
        Self {
            symbols,
            cash: capital,
            state: LedgerState::Flat,
            legs: Vec::new(),
            entry_index: None,
            entry_date: None,
            min_holding_period,
            costs,
            trades: Vec::new(),
        }
    }

    pub fn state(&self) -> LedgerState {
        self.state
    }

    pub fn is_flat(&self) -> bool {
        self.state == LedgerState::Flat
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<Trade> {
        self.trades
    }

    fn is_pair(&self) -> bool {
        self.symbols.len() == 2
    }

    /// Reduce a raw strategy action to the one this ledger can act on at `index`.
    pub fn filter_signal(&self, signal: SignalAction, index: usize) -> SignalAction {
        if let Some(entry_index) = self.entry_index {
            if index.saturating_sub(entry_index) < self.min_holding_period {
                return SignalAction::Hold;
            }
        }

        match (self.state, signal) {
            (_, SignalAction::Hold) => SignalAction::Hold,
            (LedgerState::Flat, SignalAction::Sell | SignalAction::Exit) => SignalAction::Hold,
            (LedgerState::Flat, SignalAction::Buy) if self.is_pair() => SignalAction::Hold,
            (LedgerState::Flat, entry) => entry,
            (_, entry) if entry.is_entry() => SignalAction::Hold,
            (LedgerState::Long, SignalAction::Sell) => SignalAction::Sell,
            (_, SignalAction::Sell) => SignalAction::Hold,
            (_, exit) => exit,
        }
    }

    /// Open a position with `fraction` of current cash. Pair keys split it evenly across legs.
    pub fn open(
        &mut self,
        signal: SignalAction,
        prices: &[f64],
        index: usize,
        date: NaiveDate,
        fraction: f64,
    ) -> EngineResult<()> {
        if !self.is_flat() {
            return Err(EngineError::invalid("cannot open a position that is already open"));
        }
        if prices.len() != self.symbols.len()
            || prices.iter().any(|p| !p.is_finite() || *p <= 0.0)
        {
            return Err(EngineError::InsufficientData {
                symbol: self.symbols.join("-"),
                message: format!("no usable price on {}", date),
            });
        }

        let (state, sides): (LedgerState, Vec<Side>) = match (signal, self.is_pair()) {
            (SignalAction::Buy | SignalAction::Long, false) => (LedgerState::Long, vec![Side::Buy]),
            (SignalAction::Short, false) => (LedgerState::Short, vec![Side::Sell]),
            (SignalAction::Long, true) => (LedgerState::PairLong, vec![Side::Buy, Side::Sell]),
            (SignalAction::Short, true) => (LedgerState::PairShort, vec![Side::Sell, Side::Buy]),
            (other, _) => {
                return Err(EngineError::invalid(format!(
                    "{:?} does not open a position",
                    other
                )))
            }
        };

        let budget = self.cash * fraction.clamp(0.0, 1.0) / sides.len() as f64;
        let mut legs = Vec::with_capacity(sides.len());
        for ((symbol, &price), side) in self.symbols.iter().zip(prices).zip(sides) {
            let effective_entry = effective_price(price, self.costs.slippage, side);
            let (quantity, fee) = match side {
                Side::Buy => {
                    let fee = commission(
                        side,
                        budget,
                        effective_entry,
                        0.0,
                        self.costs.commission_pct,
                        self.costs.commission_fixed,
                    );
                    ((budget - fee) / effective_entry, fee)
                }
                Side::Sell => {
                    let quantity = -budget / effective_entry;
                    let fee = commission(
                        side,
                        0.0,
                        effective_entry,
                        quantity,
                        self.costs.commission_pct,
                        self.costs.commission_fixed,
                    );
                    (quantity, fee)
                }
            };
            self.cash -= quantity * effective_entry + fee;
            legs.push(Leg {
                symbol: symbol.clone(),
                quantity,
                entry_price: price,
                effective_entry,
                entry_commission: fee,
            });
        }

        self.legs = legs;
        self.state = state;
        self.entry_index = Some(index);
        self.entry_date = Some(date);
        Ok(())
    }

    /// Flatten every leg at `prices`, append one trade per leg and return how many were added.
    pub fn close(&mut self, prices: &[f64], date: NaiveDate) -> EngineResult<usize> {
        if self.is_flat() {
            return Ok(0);
        }
        if prices.len() != self.legs.len() || prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(EngineError::InsufficientData {
                symbol: self.symbols.join("-"),
                message: format!("no usable exit price on {}", date),
            });
        }

        let entry_date = self.entry_date.unwrap_or(date);
        for (leg, &price) in self.legs.drain(..).zip(prices) {
            let (proceeds, effective_exit, fee) = leg.closing_flow(price, &self.costs);
            self.cash += proceeds;

            let direction = if leg.quantity > 0.0 {
                TradeDirection::Long
            } else {
                TradeDirection::Short
            };
            let return_pct = if leg.effective_entry == 0.0 {
                0.0
            } else {
                match direction {
                    TradeDirection::Long => {
                        (effective_exit - leg.effective_entry) / leg.effective_entry * 100.0
                    }
                    TradeDirection::Short => {
                        (leg.effective_entry - effective_exit) / leg.effective_entry * 100.0
                    }
                }
            };

            self.trades.push(Trade {
                symbol: leg.symbol,
                direction,
                entry_date,
                exit_date: date,
                entry_price: leg.entry_price,
                exit_price: price,
                quantity: leg.quantity,
                pnl: leg.quantity * (effective_exit - leg.effective_entry),
                return_pct,
                costs: leg.entry_commission + fee,
            });
        }

        let added = match self.state {
            LedgerState::PairLong | LedgerState::PairShort => 2,
            _ => 1,
        };
        self.state = LedgerState::Flat;
        self.entry_index = None;
        self.entry_date = None;
        Ok(added)
    }

    /// Cash plus what closing every leg at `prices` under `costs` would return.
    pub fn liquidation_value(&self, prices: &[f64], costs: &TradingCosts) -> f64 {
        self.cash
            + self
                .legs
                .iter()
                .zip(prices)
                .map(|(leg, &price)| leg.closing_flow(price, costs).0)
                .sum::<f64>()
    }

    /// Frictionless mark used for equity curves.
    pub fn mark_to_market(&self, prices: &[f64]) -> f64 {
        self.liquidation_value(prices, &TradingCosts::FRICTIONLESS)
    }
}
