//! Graham Valuation Module.
//!
//! Turns a security's fundamentals into intrinsic value estimates, four
//! dimension scores (each 0-25), a composite score and a recommendation tier.
//!
//! # Dimensions
//!
//! 1. **Financial health**: current ratio, quick ratio, debt ratio
//! 2. **Profitability**: ROE, net margin, gross margin
//! 3. **Valuation**: PE, PB, PEG (lower is better)
//! 4. **Safety margin**: discount of price to the primary intrinsic value
//!
//! # Usage
//!
//! ```ignore
//! use graham_pipeline::valuation::{FinancialRecord, ValuationEngine};
//!
//! let engine = ValuationEngine::default();
//! let record = FinancialRecord::from_payload(&payload)?;
//! let result = engine.evaluate("600519", &record, chrono::Utc::now())?;
//!
//! println!("{}: {:.1} ({})", result.security_id, result.composite_score, result.recommendation_tier);
//! ```

pub mod config;
pub mod engine;
pub mod types;

pub use config::{
    FinancialHealthThresholds, ModelThresholds, ProfitabilityThresholds, RiskThresholds, ScoreBand,
    ScreenThresholds, ValuationRatioThresholds, ValuationThresholds,
};
pub use engine::{
    intrinsic_value_asset_based, intrinsic_value_earnings_based, intrinsic_value_simple, passes_screen,
    risk_level, safety_margin_pct, select_primary_model, tier, ValuationEngine,
};
pub use types::{
    DimensionScores, FinancialRecord, IntrinsicValueModel, RawFinancialRecord, RecommendationTier, RiskLevel,
    ValuationError, ValuationResult,
};
