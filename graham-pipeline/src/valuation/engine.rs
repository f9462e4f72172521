//! Graham valuation engine.
//!
//! Pure functions from a [`FinancialRecord`] and [`ValuationThresholds`] to a
//! [`ValuationResult`]. No clock or randomness is read here; the caller
//! supplies `computed_at`.

use chrono::{DateTime, Utc};
use tracing::debug;

use graham_common::Validate;

use crate::error::PipelineError;

use super::config::{ModelThresholds, RiskThresholds, ScreenThresholds, ValuationThresholds, DIMENSION_MAX};
use super::types::{
    DimensionScores, FinancialRecord, IntrinsicValueModel, RecommendationTier, RiskLevel, ValuationError,
    ValuationResult,
};

/// Base multiple for a no-growth company.
const NO_GROWTH_PE: f64 = 8.5;
/// AAA yield (%) at the time the formula was calibrated.
const BASELINE_BOND_YIELD: f64 = 4.4;

// ============================================================================
// Intrinsic Value Models
// ============================================================================

/// `eps × (8.5 + 2g) × 4.4 / bond_yield`, with `g` and `bond_yield` in percent.
pub fn intrinsic_value_simple(eps: f64, growth_rate: f64, bond_yield: f64) -> Result<f64, ValuationError> {
    if !(eps > 0.0) {
        return Err(ValuationError::InvalidInput(format!("eps must be positive, got {}", eps)));
    }
    if !(bond_yield > 0.0) {
        return Err(ValuationError::InvalidInput(format!(
            "bond_yield must be positive, got {}",
            bond_yield
        )));
    }
    let value = eps * (NO_GROWTH_PE + 2.0 * growth_rate) * BASELINE_BOND_YIELD / bond_yield;
    Ok(value.max(0.0))
}

/// Book value per share scaled by `adjustment_factor`.
pub fn intrinsic_value_asset_based(book_value_per_share: f64, adjustment_factor: f64) -> Result<f64, ValuationError> {
    if !(book_value_per_share > 0.0) {
        return Err(ValuationError::InvalidInput(format!(
            "book_value_per_share must be positive, got {}",
            book_value_per_share
        )));
    }
    if !(adjustment_factor > 0.0) {
        return Err(ValuationError::InvalidInput(format!(
            "adjustment_factor must be positive, got {}",
            adjustment_factor
        )));
    }
    Ok(book_value_per_share * adjustment_factor)
}

/// Earnings grown at `projected_growth` (%) for the projection period,
/// capitalized at the terminal multiple and discounted back at `discount_rate`.
pub fn intrinsic_value_earnings_based(
    eps: f64,
    projected_growth: f64,
    discount_rate: f64,
    models: &ModelThresholds,
) -> Result<f64, ValuationError> {
    if !(eps > 0.0) {
        return Err(ValuationError::InvalidInput(format!("eps must be positive, got {}", eps)));
    }
    if !(discount_rate > -1.0) || !(projected_growth > -100.0) {
        return Err(ValuationError::InvalidInput(format!(
            "growth {}% or discount rate {} out of range",
            projected_growth, discount_rate
        )));
    }
    let years = models.projection_years as i32;
    let projected_eps = eps * (1.0 + projected_growth / 100.0).powi(years);
    Ok(projected_eps * models.terminal_pe / (1.0 + discount_rate).powi(years))
}

/// Which model's estimate is authoritative for `record`.
pub fn select_primary_model(record: &FinancialRecord, models: &ModelThresholds) -> IntrinsicValueModel {
    if record.roe < models.min_roe_for_earnings || record.growth_rate < 0.0 {
        IntrinsicValueModel::AssetBased
    } else if record.growth_rate > models.high_growth_threshold {
        IntrinsicValueModel::EarningsBased
    } else {
        IntrinsicValueModel::Simple
    }
}

// ============================================================================
// Classification
// ============================================================================

/// `(intrinsic − price) / intrinsic`. Zero when there is no positive estimate.
pub fn safety_margin_pct(intrinsic_value: f64, current_price: f64) -> f64 {
    if intrinsic_value > 0.0 && current_price.is_finite() {
        (intrinsic_value - current_price) / intrinsic_value
    } else {
        0.0
    }
}

/// Tier for a composite score; lower bounds are inclusive.
pub fn tier(composite: f64) -> RecommendationTier {
    if composite >= 90.0 {
        RecommendationTier::StronglyRecommend
    } else if composite >= 75.0 {
        RecommendationTier::Recommend
    } else if composite >= 60.0 {
        RecommendationTier::Consider
    } else {
        RecommendationTier::NotRecommended
    }
}

pub fn risk_level(record: &FinancialRecord, risk: &RiskThresholds) -> RiskLevel {
    if record.debt_ratio > risk.high_debt_ratio || record.current_ratio < risk.min_current_ratio {
        RiskLevel::High
    } else if record.debt_ratio <= risk.low_debt_ratio
        && record.current_ratio >= risk.comfortable_current_ratio
        && record.quick_ratio >= risk.comfortable_quick_ratio
    {
        RiskLevel::Low
    } else {
        RiskLevel::Medium
    }
}

/// Preliminary Graham screen.
pub fn passes_screen(record: &FinancialRecord, screen: &ScreenThresholds) -> bool {
    record.market_cap >= screen.min_market_cap
        && record.pe_ratio > 0.0
        && record.pe_ratio <= screen.max_pe_ratio
        && record.pb_ratio > 0.0
        && record.pb_ratio <= screen.max_pb_ratio
        && record.roe >= screen.min_roe
        && (0.0..=screen.max_debt_ratio).contains(&record.debt_ratio)
        && record.eps > 0.0
}

fn clamp_dimension(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, DIMENSION_MAX)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Scores records against a fixed set of thresholds.
#[derive(Debug, Clone)]
pub struct ValuationEngine {
    thresholds: ValuationThresholds,
}

impl Default for ValuationEngine {
    fn default() -> Self {
        Self {
            thresholds: ValuationThresholds::default(),
        }
    }
}

impl ValuationEngine {
    pub fn new(thresholds: ValuationThresholds) -> Result<Self, PipelineError> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &ValuationThresholds {
        &self.thresholds
    }

    pub fn score_financial_health(&self, record: &FinancialRecord) -> f64 {
        let t = &self.thresholds.financial_health;
        clamp_dimension(
            t.current_ratio.score(record.current_ratio)
                + t.quick_ratio.score(record.quick_ratio)
                + t.debt_ratio.score(record.debt_ratio),
        )
    }

    pub fn score_profitability(&self, record: &FinancialRecord) -> f64 {
        let t = &self.thresholds.profitability;
        clamp_dimension(
            t.roe.score(record.roe) + t.net_margin.score(record.net_margin) + t.gross_margin.score(record.gross_margin),
        )
    }

    pub fn score_valuation(&self, record: &FinancialRecord) -> f64 {
        let t = &self.thresholds.valuation;
        let mut score = 0.0;
        if record.pe_ratio > 0.0 {
            score += t.pe_ratio.score(record.pe_ratio);
            if record.growth_rate > 0.0 {
                score += t.peg.score(record.pe_ratio / record.growth_rate);
            }
        }
        if record.pb_ratio > 0.0 {
            score += t.pb_ratio.score(record.pb_ratio);
        }
        clamp_dimension(score)
    }

    /// Step score at each configured tier; below the lowest tier the score
    /// falls proportionally to zero.
    pub fn score_safety_margin(&self, intrinsic_value: f64, current_price: f64) -> f64 {
        let pct = safety_margin_pct(intrinsic_value, current_price);
        let tiers = &self.thresholds.safety_margin_tiers;
        let scores = &self.thresholds.safety_margin_scores;

        if let Some((_, score)) = tiers.iter().zip(scores).find(|(tier, _)| pct >= **tier) {
            return clamp_dimension(*score);
        }
        match (tiers.last(), scores.last()) {
            (Some(lowest), Some(score)) if *lowest > 0.0 => clamp_dimension(pct / lowest * score),
            _ => 0.0,
        }
    }

    /// Value one security.
    pub fn evaluate(
        &self,
        security_id: &str,
        record: &FinancialRecord,
        computed_at: DateTime<Utc>,
    ) -> Result<ValuationResult, ValuationError> {
        let models = &self.thresholds.models;

        let simple = intrinsic_value_simple(record.eps, record.growth_rate, record.bond_yield).ok();
        let asset_based =
            intrinsic_value_asset_based(record.book_value_per_share, models.asset_adjustment_factor).ok();
        let earnings_based =
            intrinsic_value_earnings_based(record.eps, record.growth_rate, models.earnings_discount_rate, models).ok();

        let selected = select_primary_model(record, models);
        let estimate = |model| match model {
            IntrinsicValueModel::Simple => simple,
            IntrinsicValueModel::AssetBased => asset_based,
            IntrinsicValueModel::EarningsBased => earnings_based,
        };

        let (primary_model, intrinsic_value) = match estimate(selected) {
            Some(value) => (selected, value),
            None => {
                let value = asset_based.ok_or_else(|| {
                    ValuationError::NoApplicableModel(format!(
                        "eps {} and book value {} are both non-positive",
                        record.eps, record.book_value_per_share
                    ))
                })?;
                debug!(
                    security_id,
                    selected = %selected,
                    "Selected model not computable, using asset-based estimate"
                );
                (IntrinsicValueModel::AssetBased, value)
            }
        };

        let dimension_scores = DimensionScores {
            financial_health: self.score_financial_health(record),
            profitability: self.score_profitability(record),
            valuation: self.score_valuation(record),
            safety_margin: self.score_safety_margin(intrinsic_value, record.current_price),
        };
        let composite_score = dimension_scores.total();

        Ok(ValuationResult {
            security_id: security_id.to_string(),
            intrinsic_value_simple: simple,
            intrinsic_value_asset_based: asset_based,
            intrinsic_value_earnings_based: earnings_based,
            primary_model,
            intrinsic_value,
            dimension_scores,
            composite_score,
            safety_margin_pct: safety_margin_pct(intrinsic_value, record.current_price) * 100.0,
            recommendation_tier: tier(composite_score),
            risk_level: risk_level(record, &self.thresholds.risk),
            passes_screen: passes_screen(record, &self.thresholds.screen),
            computed_at,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
