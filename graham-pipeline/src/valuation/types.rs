//! Valuation types.
//!
//! Units: `growth_rate` and `bond_yield` are percentages (10.0 = 10%);
//! `roe`, margins and `debt_ratio` are fractions (0.15 = 15%).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::{FailureKind, TaskFailure};

// ============================================================================
// Errors
// ============================================================================

/// Why a record could not be valued.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValuationError {
    /// A value is outside the domain of a formula
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A field every model needs is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// No intrinsic value model produced an estimate
    #[error("no valuation model applicable: {0}")]
    NoApplicableModel(String),
}

impl From<ValuationError> for TaskFailure {
    fn from(err: ValuationError) -> Self {
        let kind = match err {
            ValuationError::InvalidInput(_) => FailureKind::InvalidFinancialInput,
            ValuationError::MissingField(_) | ValuationError::NoApplicableModel(_) => {
                FailureKind::ValuationModelError
            }
        };
        TaskFailure::new(kind, err.to_string())
    }
}

// ============================================================================
// Financial Record
// ============================================================================

/// Fundamentals of one security. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    /// Earnings per share
    pub eps: f64,
    /// Expected annual growth (%)
    pub growth_rate: f64,
    pub book_value_per_share: f64,
    /// Return on equity (fraction)
    pub roe: f64,
    pub net_margin: f64,
    pub gross_margin: f64,
    /// Liabilities / assets
    pub debt_ratio: f64,
    pub current_ratio: f64,
    pub quick_ratio: f64,
    pub pe_ratio: f64,
    pub pb_ratio: f64,
    pub market_cap: f64,
    pub current_price: f64,
    /// AAA corporate bond yield (%)
    pub bond_yield: f64,
}

/// Record as decoded from a source payload; every field may be absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFinancialRecord {
    pub eps: Option<f64>,
    #[serde(alias = "net_profit_yoy")]
    pub growth_rate: Option<f64>,
    #[serde(alias = "bvps")]
    pub book_value_per_share: Option<f64>,
    pub roe: Option<f64>,
    pub net_margin: Option<f64>,
    pub gross_margin: Option<f64>,
    pub debt_ratio: Option<f64>,
    pub current_ratio: Option<f64>,
    pub quick_ratio: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    #[serde(alias = "total_market_cap")]
    pub market_cap: Option<f64>,
    #[serde(alias = "price")]
    pub current_price: Option<f64>,
    pub bond_yield: Option<f64>,
}

fn required(value: Option<f64>, field: &'static str) -> Result<f64, ValuationError> {
    let value = value.ok_or(ValuationError::MissingField(field))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValuationError::InvalidInput(format!("{} is not finite", field)))
    }
}

impl TryFrom<RawFinancialRecord> for FinancialRecord {
    type Error = ValuationError;

    fn try_from(raw: RawFinancialRecord) -> Result<Self, Self::Error> {
        let record = Self {
            eps: required(raw.eps, "eps")?,
            growth_rate: required(raw.growth_rate, "growth_rate")?,
            book_value_per_share: required(raw.book_value_per_share, "book_value_per_share")?,
            roe: required(raw.roe, "roe")?,
            net_margin: required(raw.net_margin, "net_margin")?,
            gross_margin: required(raw.gross_margin, "gross_margin")?,
            debt_ratio: required(raw.debt_ratio, "debt_ratio")?,
            current_ratio: required(raw.current_ratio, "current_ratio")?,
            quick_ratio: required(raw.quick_ratio, "quick_ratio")?,
            pe_ratio: required(raw.pe_ratio, "pe_ratio")?,
            pb_ratio: required(raw.pb_ratio, "pb_ratio")?,
            market_cap: required(raw.market_cap, "market_cap")?,
            current_price: required(raw.current_price, "current_price")?,
            bond_yield: required(raw.bond_yield, "bond_yield")?,
        };

        if record.current_price <= 0.0 {
            return Err(ValuationError::InvalidInput(format!(
                "current_price must be positive, got {}",
                record.current_price
            )));
        }
        if record.bond_yield <= 0.0 {
            return Err(ValuationError::InvalidInput(format!(
                "bond_yield must be positive, got {}",
                record.bond_yield
            )));
        }
        Ok(record)
    }
}

impl FinancialRecord {
    /// Decode a JSON payload into a checked record.
    pub fn from_payload(payload: &str) -> Result<Self, TaskFailure> {
        let raw: RawFinancialRecord = serde_json::from_str(payload)
            .map_err(|e| TaskFailure::new(FailureKind::ParseError, e.to_string()))?;
        Ok(Self::try_from(raw)?)
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Intrinsic value models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrinsicValueModel {
    /// EPS × (8.5 + 2g) × 4.4 / Y
    Simple,
    /// Adjusted book value
    AssetBased,
    /// Discounted projected earnings
    EarningsBased,
}

impl fmt::Display for IntrinsicValueModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::AssetBased => write!(f, "asset_based"),
            Self::EarningsBased => write!(f, "earnings_based"),
        }
    }
}

/// The four scoring dimensions, each in `[0, 25]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub financial_health: f64,
    pub profitability: f64,
    pub valuation: f64,
    pub safety_margin: f64,
}

impl DimensionScores {
    pub fn total(&self) -> f64 {
        self.financial_health + self.profitability + self.valuation + self.safety_margin
    }
}

/// Recommendation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationTier {
    NotRecommended,
    Consider,
    Recommend,
    StronglyRecommend,
}

impl fmt::Display for RecommendationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StronglyRecommend => write!(f, "strongly recommend"),
            Self::Recommend => write!(f, "recommend"),
            Self::Consider => write!(f, "consider"),
            Self::NotRecommended => write!(f, "not recommended"),
        }
    }
}

/// Risk bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Valuation of one security in one batch. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationResult {
    pub security_id: String,
    pub intrinsic_value_simple: Option<f64>,
    pub intrinsic_value_asset_based: Option<f64>,
    pub intrinsic_value_earnings_based: Option<f64>,
    /// Model whose estimate drives the safety margin
    pub primary_model: IntrinsicValueModel,
    /// Estimate of `primary_model`
    pub intrinsic_value: f64,
    pub dimension_scores: DimensionScores,
    /// Sum of the four dimension scores
    pub composite_score: f64,
    /// (intrinsic − price) / intrinsic, in percent
    pub safety_margin_pct: f64,
    pub recommendation_tier: RecommendationTier,
    pub risk_level: RiskLevel,
    /// Verdict of the preliminary Graham screen
    pub passes_screen: bool,
    pub computed_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> serde_json::Value {
        json!({
            "eps": 2.0,
            "growth_rate": 8.0,
            "bvps": 12.0,
            "roe": 0.16,
            "net_margin": 0.12,
            "gross_margin": 0.35,
            "debt_ratio": 0.4,
            "current_ratio": 1.8,
            "quick_ratio": 1.1,
            "pe_ratio": 12.0,
            "pb_ratio": 1.5,
            "total_market_cap": 8.0e9,
            "current_price": 24.0,
            "bond_yield": 4.4
        })
    }

    #[test]
    fn test_from_payload_accepts_aliases() {
        let record = FinancialRecord::from_payload(&payload().to_string()).unwrap();
        assert_eq!(record.book_value_per_share, 12.0);
        assert_eq!(record.market_cap, 8.0e9);
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        let failure = FinancialRecord::from_payload("<html>blocked</html>").unwrap_err();
        assert_eq!(failure.kind, FailureKind::ParseError);
    }

    #[test]
    fn test_missing_field_is_model_error() {
        let mut value = payload();
        value.as_object_mut().unwrap().remove("roe");
        let failure = FinancialRecord::from_payload(&value.to_string()).unwrap_err();
        assert_eq!(failure.kind, FailureKind::ValuationModelError);
        assert!(failure.detail.contains("roe"));
    }

    #[test]
    fn test_non_positive_price_is_invalid_input() {
        let mut value = payload();
        value["current_price"] = json!(0.0);
        let failure = FinancialRecord::from_payload(&value.to_string()).unwrap_err();
        assert_eq!(failure.kind, FailureKind::InvalidFinancialInput);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(RecommendationTier::StronglyRecommend > RecommendationTier::Recommend);
        assert!(RecommendationTier::Consider > RecommendationTier::NotRecommended);
        assert_eq!(RecommendationTier::StronglyRecommend.to_string(), "strongly recommend");
    }
}
