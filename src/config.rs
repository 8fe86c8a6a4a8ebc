// =============================================================================
// Engine Configuration — environment-driven, validated at startup
// =============================================================================
//
// Every tunable lives here. Configuration is read once from the process
// environment (with `.env` support via dotenv in main), validated fail-closed,
// and immutable afterwards. Unknown environment keys are ignored.
//
// Secrets may arrive encrypted with the `ENC:` prefix; they are decrypted
// with the MASTER_KEY before use and never logged.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Defaults
// =============================================================================

/// Symbols traded when SYMBOLS is not set.
const DEFAULT_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT"];

/// Tolerance when checking that portfolio weights sum to 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

fn default_timeframe_weights() -> Vec<(String, f64)> {
    vec![
        ("15m".to_string(), 0.25),
        ("1h".to_string(), 0.35),
        ("4h".to_string(), 0.40),
    ]
}

// =============================================================================
// Per-symbol static parameters
// =============================================================================

/// Position-size band as fractions of the capital allocated to the symbol.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PositionSizeBand {
    pub min: f64,
    pub standard: f64,
    pub max: f64,
}

/// Trailing-stop parameters (both as fractions, e.g. 0.01 = 1 %).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrailingParams {
    /// Profit fraction at which trailing activates (closed boundary).
    pub activation: f64,
    /// Distance between price and trailing stop.
    pub distance: f64,
}

/// ATR-based stop/target generation parameters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AtrParams {
    pub period: usize,
    pub stop_multiplier: f64,
    pub target_multiplier: f64,
    /// Stop distance clamp, as fractions of price.
    pub min_stop_distance: f64,
    pub max_stop_distance: f64,
}

/// Daily trade limits for one symbol.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DailyLimits {
    pub max_trades: u32,
    pub max_loss_trades: u32,
    /// Minimum seconds between two entries on the same symbol.
    pub cooldown_secs: u64,
}

/// Static parameters for one traded symbol. Built at startup, immutable.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub quote_precision: u32,
    pub lot_size: f64,
    pub max_leverage: u32,
    pub leverage: u32,
    pub portfolio_weight: f64,
    pub size_band: PositionSizeBand,
    pub max_positions: u32,
    /// (timeframe, weight) pairs in analysis order; weights sum to 1.
    pub timeframe_weights: Vec<(String, f64)>,
    /// Minimum |finalScore| to consider an entry (strict `>` at the boundary).
    pub signal_threshold: f64,
    /// Minimum fused confidence [0,100] to enter.
    pub confidence_required: f64,
    /// Required fraction of timeframe weight agreeing on direction.
    pub timeframe_agreement: f64,
    /// Fallback stop/target as fractions when ATR is unavailable.
    pub fallback_stop_pct: f64,
    pub fallback_target_pct: f64,
    pub trailing: TrailingParams,
    pub atr: AtrParams,
    pub daily: DailyLimits,
    /// When set, entries additionally require RSI outside [25, 75].
    pub extreme_rsi_only: bool,
}

impl SymbolSpec {
    /// Built-in defaults for a symbol; per-symbol env keys override fields.
    fn defaults(symbol: &str) -> Self {
        // ETH-like majors get the momentum-tilted strategy and a higher
        // entry bar; everything else starts from the BTC profile.
        let eth_like = symbol.starts_with("ETH");
        Self {
            symbol: symbol.to_string(),
            quote_precision: 2,
            lot_size: 0.001,
            max_leverage: 100,
            leverage: 10,
            portfolio_weight: 0.0,
            size_band: PositionSizeBand {
                min: 0.10,
                standard: 0.20,
                max: 0.30,
            },
            max_positions: 2,
            timeframe_weights: default_timeframe_weights(),
            signal_threshold: if eth_like { 0.50 } else { 0.25 },
            confidence_required: 45.0,
            timeframe_agreement: 0.60,
            fallback_stop_pct: 0.01,
            fallback_target_pct: 0.02,
            trailing: TrailingParams {
                activation: 0.01,
                distance: 0.005,
            },
            atr: AtrParams {
                period: 14,
                stop_multiplier: 1.5,
                target_multiplier: 3.0,
                min_stop_distance: 0.004,
                max_stop_distance: 0.03,
            },
            daily: DailyLimits {
                max_trades: 10,
                max_loss_trades: 3,
                cooldown_secs: 1800,
            },
            extreme_rsi_only: false,
        }
    }
}

// =============================================================================
// Network tuning
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfig {
    /// Seconds of stream silence before a forced reconnect.
    pub ws_response_timeout_secs: u64,
    /// Cap on the exponential reconnect backoff.
    pub ws_max_reconnect_delay_secs: u64,
    /// Reconnect attempts before falling back to REST polling.
    pub ws_max_attempts: u32,
    /// Base wait between REST retries.
    pub network_retry_wait_secs: u64,
    /// Default timeout applied to all HTTP calls.
    pub http_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_response_timeout_secs: 90,
            ws_max_reconnect_delay_secs: 60,
            ws_max_attempts: 10,
            network_retry_wait_secs: 2,
            http_timeout_secs: 30,
        }
    }
}

// =============================================================================
// Top-level configuration
// =============================================================================

/// Exchange credentials. Never serialized; Debug redacts.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub symbols: Vec<String>,
    pub symbol_specs: HashMap<String, SymbolSpec>,

    // --- Capital & risk ------------------------------------------------------
    pub max_total_allocation: f64,
    pub kelly_fraction: f64,
    pub daily_loss_limit: f64,
    pub weekly_loss_limit: f64,
    pub max_drawdown: f64,
    pub max_loss_per_position: f64,
    pub min_notional_usd: f64,

    // --- Fees ----------------------------------------------------------------
    pub maker_fee: f64,
    pub taker_fee: f64,

    // --- Signal fusion -------------------------------------------------------
    pub enable_ml_models: bool,
    pub use_llm_sentiment: bool,
    pub enable_cost_optimization: bool,
    pub technical_weight: f64,
    pub ml_weight: f64,
    pub news_weight: f64,
    pub min_news_confidence: f64,

    // --- Scheduling ----------------------------------------------------------
    pub trading_cycle_interval_secs: u64,
    pub capital_update_interval_secs: u64,
    pub ml_retrain_hours: i64,

    // --- Infrastructure ------------------------------------------------------
    pub network: NetworkConfig,
    pub database_path: String,
    pub model_dir: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub paper_trading: bool,
    pub bind_addr: String,
    pub credentials: Credentials,
}

impl Config {
    /// Read and validate the full configuration from the environment.
    ///
    /// Fail-closed: any malformed or inconsistent value is a
    /// [`EngineError::Configuration`], and the engine refuses to start.
    pub fn from_env() -> EngineResult<Self> {
        let master_key = env_string("MASTER_KEY");

        let symbols: Vec<String> = match env_string("SYMBOLS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        };
        if symbols.is_empty() {
            return Err(EngineError::Configuration("SYMBOLS is empty".into()));
        }

        let mut symbol_specs = HashMap::new();
        for symbol in &symbols {
            symbol_specs.insert(symbol.clone(), Self::symbol_spec_from_env(symbol, &symbols)?);
        }

        // Portfolio weights must sum to 1.0 +/- tolerance.
        let weight_sum: f64 = symbol_specs.values().map(|s| s.portfolio_weight).sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::Configuration(format!(
                "portfolio weights sum to {weight_sum:.4}, expected 1.0 +/- {WEIGHT_SUM_TOLERANCE}"
            )));
        }

        let credentials = Credentials {
            api_key: env_secret("EXCHANGE_API_KEY", &master_key)?.unwrap_or_default(),
            api_secret: env_secret("EXCHANGE_API_SECRET", &master_key)?.unwrap_or_default(),
            passphrase: env_secret("EXCHANGE_PASSPHRASE", &master_key)?.unwrap_or_default(),
        };

        let paper_trading = env_bool("PAPER_TRADING", true);
        if !paper_trading && (credentials.api_key.is_empty() || credentials.api_secret.is_empty()) {
            return Err(EngineError::Configuration(
                "live trading requires EXCHANGE_API_KEY and EXCHANGE_API_SECRET".into(),
            ));
        }

        let maker_fee = env_f64_in("MAKER_FEE", 0.0002, 0.0..=0.01)?;
        let taker_fee = env_f64_in("TAKER_FEE", 0.0006, 0.0..=0.01)?;
        if maker_fee > taker_fee {
            return Err(EngineError::Configuration(format!(
                "MAKER_FEE={maker_fee} exceeds TAKER_FEE={taker_fee}"
            )));
        }

        let config = Self {
            symbols,
            symbol_specs,
            max_total_allocation: env_f64_in("MAX_TOTAL_ALLOCATION", 1.0, 0.0..=1.0)?,
            kelly_fraction: env_f64_in("KELLY_FRACTION", 0.25, 0.0..=1.0)?,
            daily_loss_limit: env_f64_in("DAILY_LOSS_LIMIT", 0.05, 0.0..=1.0)?,
            weekly_loss_limit: env_f64_in("WEEKLY_LOSS_LIMIT", 0.10, 0.0..=1.0)?,
            max_drawdown: env_f64_in("MAX_DRAWDOWN", 0.20, 0.0..=1.0)?,
            max_loss_per_position: env_f64_in("MAX_LOSS_PER_POSITION", 0.8, 0.0..=1.0)?,
            min_notional_usd: env_f64_in("MIN_NOTIONAL_USD", 5.0, 0.0..=f64::MAX)?,
            maker_fee,
            taker_fee,
            enable_ml_models: env_bool("ENABLE_ML_MODELS", true),
            use_llm_sentiment: env_bool("USE_GPT_4", false),
            enable_cost_optimization: env_bool("ENABLE_COST_OPTIMIZATION", true),
            technical_weight: env_f64_in("TECHNICAL_WEIGHT", 0.60, 0.0..=1.0)?,
            ml_weight: env_f64_in("ML_WEIGHT", 0.80, 0.0..=1.0)?,
            news_weight: env_f64_in("NEWS_WEIGHT", 0.20, 0.0..=1.0)?,
            min_news_confidence: env_f64_in("MIN_NEWS_CONFIDENCE", 0.6, 0.0..=1.0)?,
            trading_cycle_interval_secs: env_u64("TRADING_CYCLE_INTERVAL", 300)?,
            capital_update_interval_secs: env_u64("CAPITAL_UPDATE_INTERVAL", 30)?,
            ml_retrain_hours: env_u64("ML_RETRAIN_HOURS", 24)? as i64,
            network: NetworkConfig {
                ws_response_timeout_secs: env_u64("WS_RESPONSE_TIMEOUT", 90)?,
                ws_max_reconnect_delay_secs: env_u64("WS_MAX_RECONNECT_DELAY", 60)?,
                ws_max_attempts: env_u64("WS_MAX_ATTEMPTS", 10)? as u32,
                network_retry_wait_secs: env_u64("NETWORK_RETRY_WAIT", 2)?,
                http_timeout_secs: env_u64("HTTP_TIMEOUT", 30)?,
            },
            database_path: env_string("DATABASE_PATH")
                .unwrap_or_else(|| "borealis.db".to_string()),
            model_dir: env_string("MODEL_DIR").unwrap_or_else(|| "models".to_string()),
            telegram_bot_token: env_secret("TELEGRAM_BOT_TOKEN", &master_key)?,
            telegram_chat_id: env_string("TELEGRAM_CHAT_ID"),
            paper_trading,
            bind_addr: env_string("BOREALIS_BIND_ADDR")
                .unwrap_or_else(|| "0.0.0.0:3001".to_string()),
            credentials,
        };

        info!(
            symbols = ?config.symbols,
            paper_trading = config.paper_trading,
            cycle_interval_secs = config.trading_cycle_interval_secs,
            "configuration loaded"
        );

        Ok(config)
    }

    pub fn spec(&self, symbol: &str) -> EngineResult<&SymbolSpec> {
        self.symbol_specs
            .get(symbol)
            .ok_or_else(|| EngineError::Configuration(format!("unknown symbol {symbol}")))
    }

    // -------------------------------------------------------------------------
    // Per-symbol parsing
    // -------------------------------------------------------------------------

    fn symbol_spec_from_env(symbol: &str, all_symbols: &[String]) -> EngineResult<SymbolSpec> {
        let mut spec = SymbolSpec::defaults(symbol);

        if let Some(lev) = env_string(&format!("LEVERAGE_{symbol}")) {
            let lev: u32 = lev.parse().map_err(|_| {
                EngineError::Configuration(format!("LEVERAGE_{symbol} is not an integer"))
            })?;
            if !(1..=100).contains(&lev) || lev > spec.max_leverage {
                return Err(EngineError::Configuration(format!(
                    "LEVERAGE_{symbol}={lev} outside 1..={}",
                    spec.max_leverage.min(100)
                )));
            }
            spec.leverage = lev;
        }

        match env_string(&format!("PORTFOLIO_WEIGHT_{symbol}")) {
            Some(w) => {
                spec.portfolio_weight = w.parse().map_err(|_| {
                    EngineError::Configuration(format!("PORTFOLIO_WEIGHT_{symbol} is not a number"))
                })?;
            }
            // Without explicit weights, split capital evenly.
            None => spec.portfolio_weight = 1.0 / all_symbols.len() as f64,
        }

        match env_string(&format!("POSITION_SIZE_RANGE_{symbol}")) {
            Some(raw) => {
                let parts: Vec<f64> = raw
                    .split(',')
                    .map(|p| p.trim().parse::<f64>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| {
                        EngineError::Configuration(format!(
                            "POSITION_SIZE_RANGE_{symbol} must be 'min,standard,max'"
                        ))
                    })?;
                if parts.len() != 3 || parts.windows(2).any(|w| w[0] > w[1]) {
                    return Err(EngineError::Configuration(format!(
                        "POSITION_SIZE_RANGE_{symbol} must be three ascending fractions"
                    )));
                }
                spec.size_band = PositionSizeBand {
                    min: parts[0],
                    standard: parts[1],
                    max: parts[2],
                };
            }
            // Fail closed for symbols outside the built-in defaults table.
            None if !DEFAULT_SYMBOLS.contains(&symbol) => {
                return Err(EngineError::Configuration(format!(
                    "POSITION_SIZE_RANGE_{symbol} is required for non-default symbols"
                )));
            }
            None => {}
        }

        if let Some(mp) = env_string(&format!("MAX_POSITIONS_{symbol}")) {
            spec.max_positions = mp.parse().map_err(|_| {
                EngineError::Configuration(format!("MAX_POSITIONS_{symbol} is not an integer"))
            })?;
        }

        if let Some(flag) = env_string(&format!("EXTREME_RSI_ONLY_{symbol}")) {
            spec.extreme_rsi_only = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(spec)
    }
}

// =============================================================================
// Environment helpers
// =============================================================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_u64(key: &str, default: u64) -> EngineResult<u64> {
    match env_string(key) {
        Some(v) => v
            .parse()
            .map_err(|_| EngineError::Configuration(format!("{key} is not an integer"))),
        None => Ok(default),
    }
}

fn env_f64_in(key: &str, default: f64, range: std::ops::RangeInclusive<f64>) -> EngineResult<f64> {
    let value = match env_string(key) {
        Some(v) => v
            .parse()
            .map_err(|_| EngineError::Configuration(format!("{key} is not a number")))?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(EngineError::Configuration(format!(
            "{key}={value} outside [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

/// Read a possibly-encrypted secret. Values with the `ENC:` prefix are
/// decrypted with MASTER_KEY; plaintext values pass through unchanged.
fn env_secret(key: &str, master_key: &Option<String>) -> EngineResult<Option<String>> {
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    if let Some(cipher) = raw.strip_prefix("ENC:") {
        let Some(master) = master_key else {
            return Err(EngineError::Configuration(format!(
                "{key} is encrypted but MASTER_KEY is not set"
            )));
        };
        let plain = decrypt_secret(cipher, master)
            .map_err(|e| EngineError::Configuration(format!("failed to decrypt {key}: {e}")))?;
        return Ok(Some(plain));
    }
    Ok(Some(raw))
}

// =============================================================================
// Secret encryption helper (SHA-256 keystream, base64 transport)
// =============================================================================
//
// The first 16 bytes of the ciphertext are a random nonce; the keystream is
// SHA256(master || nonce || counter) blocks XORed over the plaintext.

/// Decrypt an `ENC:`-prefixed secret body (base64, nonce-prefixed).
pub fn decrypt_secret(cipher_b64: &str, master_key: &str) -> anyhow::Result<String> {
    use base64::Engine as _;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(cipher_b64)
        .map_err(|e| anyhow::anyhow!("invalid base64: {e}"))?;
    if blob.len() < 16 {
        anyhow::bail!("ciphertext too short");
    }
    let (nonce, body) = blob.split_at(16);
    let plain = xor_keystream(body, master_key.as_bytes(), nonce);
    String::from_utf8(plain).map_err(|_| anyhow::anyhow!("decrypted secret is not UTF-8"))
}

/// Encrypt a secret for storage in the environment (used by ops tooling and
/// round-trip tests).
pub fn encrypt_secret(plain: &str, master_key: &str, nonce: &[u8; 16]) -> String {
    use base64::Engine as _;
    let mut blob = nonce.to_vec();
    blob.extend(xor_keystream(
        plain.as_bytes(),
        master_key.as_bytes(),
        nonce,
    ));
    format!(
        "ENC:{}",
        base64::engine::general_purpose::STANDARD.encode(blob)
    )
}

fn xor_keystream(data: &[u8], key: &[u8], nonce: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut out = Vec::with_capacity(data.len());
    let mut counter: u64 = 0;
    while out.len() < data.len() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(nonce);
        hasher.update(counter.to_be_bytes());
        let block = hasher.finalize();
        for byte in block.iter() {
            if out.len() >= data.len() {
                break;
            }
            out.push(data[out.len()] ^ byte);
        }
        counter += 1;
    }
    out
}

/// Test-only access to per-symbol defaults for other modules' unit tests.
#[cfg(test)]
pub mod test_support {
    use super::SymbolSpec;

    pub fn spec_defaults(symbol: &str) -> SymbolSpec {
        SymbolSpec::defaults(symbol)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_roundtrip() {
        let nonce = [7u8; 16];
        let enc = encrypt_secret("api-secret-123", "master", &nonce);
        assert!(enc.starts_with("ENC:"));
        let dec = decrypt_secret(enc.strip_prefix("ENC:").unwrap(), "master").unwrap();
        assert_eq!(dec, "api-secret-123");
    }

    #[test]
    fn secret_wrong_key_fails_or_garbles() {
        let nonce = [9u8; 16];
        let enc = encrypt_secret("topsecret", "master", &nonce);
        let body = enc.strip_prefix("ENC:").unwrap();
        match decrypt_secret(body, "other-key") {
            Ok(plain) => assert_ne!(plain, "topsecret"),
            Err(_) => {}
        }
    }

    #[test]
    fn defaults_for_btc_and_eth_differ_on_threshold() {
        let btc = SymbolSpec::defaults("BTCUSDT");
        let eth = SymbolSpec::defaults("ETHUSDT");
        assert!((btc.signal_threshold - 0.25).abs() < f64::EPSILON);
        assert!((eth.signal_threshold - 0.50).abs() < f64::EPSILON);
        assert_eq!(btc.daily.max_trades, 10);
        let tf_sum: f64 = btc.timeframe_weights.iter().map(|(_, w)| w).sum();
        assert!((tf_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn size_band_is_ascending() {
        let spec = SymbolSpec::defaults("BTCUSDT");
        assert!(spec.size_band.min <= spec.size_band.standard);
        assert!(spec.size_band.standard <= spec.size_band.max);
    }
}
