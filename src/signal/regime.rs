// =============================================================================
// Market Regime Classifier
// =============================================================================
//
// Five sub-scores, each in [-1, 1] (volatility and volume magnitudes in
// [0, 1] territory where sign has no meaning):
//
//   price     — close vs EMA-20/50 and SMA-200, weighted alignment
//   momentum  — RSI distance from 50, MACD + histogram slope, MFI
//   trend     — ADX buckets combined with the DI spread and Supertrend
//   volatility— ATR vs its 50-bar mean and Bollinger width vs its own mean
//   volume    — spike direction plus OBV slope
//
// Selection (first match wins):
//   trending_up    trend > 0.6  AND price >  0.4 AND momentum > 0
//   trending_down  trend > 0.6  AND price < -0.4 AND momentum < 0
//   volatile       volatility > 0.7
//   ranging        |trend| < 0.4 AND |price| < 0.3
//   otherwise      sign of (price + momentum) / 2 beyond +/-0.3, else ranging
//
// Confidence: component agreement (3-way 85, 2-way 70, else 50) + |trend|
// boost - volatility penalty, clamped to [20, 95]. The selected regime
// carries a parameter pack consumed by sizing and entry thresholds.
// =============================================================================

use serde::Serialize;

use crate::indicators::IndicatorSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrendingUp => "trending_up",
            Self::TrendingDown => "trending_down",
            Self::Ranging => "ranging",
            Self::Volatile => "volatile",
        };
        write!(f, "{s}")
    }
}

/// Tuning pack attached to each regime.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegimeParams {
    pub position_size_multiplier: f64,
    pub stop_multiplier: f64,
    pub target_multiplier: f64,
    pub max_positions: u32,
    pub preferred_timeframes: &'static [&'static str],
    pub signal_threshold_multiplier: f64,
}

impl MarketRegime {
    pub fn params(self) -> RegimeParams {
        match self {
            // Trending markets: full size, wider targets, favour the slower
            // timeframes that carry the trend.
            Self::TrendingUp | Self::TrendingDown => RegimeParams {
                position_size_multiplier: 1.0,
                stop_multiplier: 1.0,
                target_multiplier: 1.3,
                max_positions: 3,
                preferred_timeframes: &["1h", "4h"],
                signal_threshold_multiplier: 1.0,
            },
            // Ranging: smaller size, tighter targets, faster timeframes,
            // demand a stronger signal before entering.
            Self::Ranging => RegimeParams {
                position_size_multiplier: 0.7,
                stop_multiplier: 0.8,
                target_multiplier: 0.8,
                max_positions: 2,
                preferred_timeframes: &["15m", "1h"],
                signal_threshold_multiplier: 1.2,
            },
            // Volatile: half size, wide stops, highest entry bar.
            Self::Volatile => RegimeParams {
                position_size_multiplier: 0.5,
                stop_multiplier: 1.5,
                target_multiplier: 1.1,
                max_positions: 1,
                preferred_timeframes: &["1h", "4h"],
                signal_threshold_multiplier: 1.4,
            },
        }
    }
}

/// Classifier output: regime, sub-scores, confidence, parameter pack.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeSnapshot {
    pub regime: MarketRegime,
    pub price_score: f64,
    pub momentum_score: f64,
    pub trend_score: f64,
    pub volatility_score: f64,
    pub volume_score: f64,
    /// [20, 95]
    pub confidence: f64,
    pub params: RegimeParams,
}

impl RegimeSnapshot {
    /// Signed scalar view for ML features: directional lean of the regime.
    pub fn score(&self) -> f64 {
        ((self.price_score + self.momentum_score) / 2.0).clamp(-1.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Sub-scores
// ---------------------------------------------------------------------------

fn price_score(ind: &IndicatorSet) -> f64 {
    let close = ind.last_close;
    if !close.is_finite() || close <= 0.0 {
        return 0.0;
    }
    // Weighted alignment against the three reference averages.
    let mut score = 0.0;
    let refs = [
        (ind.ema_20, 0.40),
        (ind.ema_50, 0.35),
        (ind.sma_200, 0.25),
    ];
    for (avg, weight) in refs {
        if let Some(avg) = avg {
            if avg > 0.0 {
                // Distance saturates at +/-2 %.
                let distance = ((close - avg) / avg / 0.02).clamp(-1.0, 1.0);
                score += weight * distance;
            }
        }
    }
    score.clamp(-1.0, 1.0)
}

fn momentum_score(ind: &IndicatorSet) -> f64 {
    let mut score = 0.0;
    let mut weight = 0.0;

    if let Some(rsi) = ind.rsi_14 {
        score += 0.4 * ((rsi - 50.0) / 50.0);
        weight += 0.4;
    }
    if let Some(hist) = ind.macd_histogram {
        let normalised = (hist / ind.last_close.abs().max(1e-9) * 1000.0).clamp(-1.0, 1.0);
        score += 0.25 * normalised;
        weight += 0.25;
    }
    if let Some(slope) = ind.macd_histogram_slope {
        score += 0.15 * (slope * 100.0).clamp(-1.0, 1.0);
        weight += 0.15;
    }
    if let Some(mfi) = ind.mfi {
        score += 0.2 * ((mfi - 50.0) / 50.0);
        weight += 0.2;
    }

    if weight > 0.0 {
        (score / weight).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn trend_score(ind: &IndicatorSet) -> f64 {
    let Some(adx) = ind.adx else {
        return 0.0;
    };
    // ADX buckets set the magnitude.
    let magnitude = if adx >= 40.0 {
        1.0
    } else if adx >= 25.0 {
        0.75
    } else if adx >= 20.0 {
        0.45
    } else {
        0.2
    };

    let di_bias = match (ind.plus_di, ind.minus_di) {
        (Some(p), Some(m)) if p + m > 0.0 => (p - m) / (p + m),
        _ => 0.0,
    };
    let st_bias = ind.supertrend_direction.unwrap_or(0.0);
    let direction = (0.7 * di_bias + 0.3 * st_bias).clamp(-1.0, 1.0);

    (magnitude * direction).clamp(-1.0, 1.0)
}

fn volatility_score(ind: &IndicatorSet) -> f64 {
    let mut score = 0.0;
    let mut weight = 0.0;

    if let Some(ratio) = ind.volatility_ratio {
        // ratio 1.0 = normal; 2x ATR reads as full volatility.
        score += 0.6 * ((ratio - 1.0).max(0.0)).min(1.0);
        weight += 0.6;
    }
    if let (Some(width), Some(prior)) = (ind.bollinger_width, ind.bollinger_width_at_back(20)) {
        if prior > 0.0 {
            score += 0.4 * (((width / prior) - 1.0).max(0.0)).min(1.0);
            weight += 0.4;
        }
    }

    if weight > 0.0 {
        (score / weight).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn volume_score(ind: &IndicatorSet) -> f64 {
    let spike = ind
        .volume_ratio
        .map(|r| ((r - 1.0) / 2.0).clamp(-1.0, 1.0))
        .unwrap_or(0.0);
    let obv = ind
        .obv_slope
        .map(|s| (s * 50.0).clamp(-1.0, 1.0))
        .unwrap_or(0.0);
    // Spike magnitude signed by the OBV direction when they disagree.
    let direction = if obv != 0.0 { obv.signum() } else { 1.0 };
    (0.5 * spike.abs() * direction + 0.5 * obv).clamp(-1.0, 1.0)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

pub fn classify(indicators: &IndicatorSet) -> RegimeSnapshot {
    let price = price_score(indicators);
    let momentum = momentum_score(indicators);
    let trend = trend_score(indicators);
    let volatility = volatility_score(indicators);
    let volume = volume_score(indicators);

    let regime = if trend > 0.6 && price > 0.4 && momentum > 0.0 {
        MarketRegime::TrendingUp
    } else if trend < -0.6 && price < -0.4 && momentum < 0.0 {
        MarketRegime::TrendingDown
    } else if volatility > 0.7 {
        MarketRegime::Volatile
    } else if trend.abs() < 0.4 && price.abs() < 0.3 {
        MarketRegime::Ranging
    } else {
        let lean = (price + momentum) / 2.0;
        if lean > 0.3 {
            MarketRegime::TrendingUp
        } else if lean < -0.3 {
            MarketRegime::TrendingDown
        } else {
            MarketRegime::Ranging
        }
    };

    // Component agreement: price, momentum, trend voting the same sign.
    let signs = [price, momentum, trend];
    let positive = signs.iter().filter(|v| **v > 0.05).count();
    let negative = signs.iter().filter(|v| **v < -0.05).count();
    let agreement = positive.max(negative);
    let base = match agreement {
        3 => 85.0,
        2 => 70.0,
        _ => 50.0,
    };
    let confidence = (base + trend.abs() * 10.0 - volatility * 15.0).clamp(20.0, 95.0);

    RegimeSnapshot {
        regime,
        price_score: price,
        momentum_score: momentum,
        trend_score: trend,
        volatility_score: volatility,
        volume_score: volume,
        confidence,
        params: regime.params(),
    }
}
