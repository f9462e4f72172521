//! Scoring thresholds.
//!
//! Each ratio contributes through a [`ScoreBand`]: zero points at `worst`,
//! full points at `best`, linear in between. A band whose `best` is below its
//! `worst` scores lower ratios higher (debt, PE, PB, PEG).

use serde::{Deserialize, Serialize};

use graham_common::validation::{require_positive, require_range};
use graham_common::{Validate, ValidationError, ValidationResult};

/// Maximum points of one scoring dimension.
pub const DIMENSION_MAX: f64 = 25.0;

// ============================================================================
// Score Band
// ============================================================================

/// Linear contribution of one ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBand {
    /// Value at (or beyond) which the ratio earns nothing
    pub worst: f64,
    /// Value at (or beyond) which the ratio earns full points
    pub best: f64,
    /// Full points
    pub points: f64,
}

impl ScoreBand {
    pub const fn new(worst: f64, best: f64, points: f64) -> Self {
        Self { worst, best, points }
    }

    /// Points earned by `value`, in `[0, points]`. Non-finite values earn nothing.
    pub fn score(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        let fraction = (value - self.worst) / (self.best - self.worst);
        self.points * fraction.clamp(0.0, 1.0)
    }

    fn validate_as(&self, field: &str) -> ValidationResult<()> {
        if !self.worst.is_finite() || !self.best.is_finite() || self.worst == self.best {
            return Err(ValidationError::invalid(
                field,
                "worst and best must be finite and distinct",
            ));
        }
        require_range(&format!("{}.points", field), self.points, 0.0, DIMENSION_MAX)
    }
}

fn validate_dimension(name: &str, bands: &[(&str, &ScoreBand)]) -> Vec<ValidationError> {
    let mut errors: Vec<ValidationError> = bands
        .iter()
        .filter_map(|(field, band)| band.validate_as(&format!("{}.{}", name, field)).err())
        .collect();

    let total: f64 = bands.iter().map(|(_, band)| band.points).sum();
    if total > DIMENSION_MAX {
        errors.push(ValidationError::Conflict {
            reason: format!("{} points sum to {}, above {}", name, total, DIMENSION_MAX),
        });
    }
    errors
}

// ============================================================================
// Dimension Thresholds
// ============================================================================

/// Liquidity and leverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialHealthThresholds {
    #[serde(default = "default_current_ratio_band")]
    pub current_ratio: ScoreBand,
    #[serde(default = "default_quick_ratio_band")]
    pub quick_ratio: ScoreBand,
    #[serde(default = "default_debt_ratio_band")]
    pub debt_ratio: ScoreBand,
}

impl Default for FinancialHealthThresholds {
    fn default() -> Self {
        Self {
            current_ratio: default_current_ratio_band(),
            quick_ratio: default_quick_ratio_band(),
            debt_ratio: default_debt_ratio_band(),
        }
    }
}

fn default_current_ratio_band() -> ScoreBand {
    ScoreBand::new(1.0, 2.0, 10.0)
}

fn default_quick_ratio_band() -> ScoreBand {
    ScoreBand::new(0.5, 1.0, 7.0)
}

fn default_debt_ratio_band() -> ScoreBand {
    ScoreBand::new(0.7, 0.3, 8.0)
}

/// Returns and margins (fractions, 0.15 = 15%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitabilityThresholds {
    #[serde(default = "default_roe_band")]
    pub roe: ScoreBand,
    #[serde(default = "default_net_margin_band")]
    pub net_margin: ScoreBand,
    #[serde(default = "default_gross_margin_band")]
    pub gross_margin: ScoreBand,
}

impl Default for ProfitabilityThresholds {
    fn default() -> Self {
        Self {
            roe: default_roe_band(),
            net_margin: default_net_margin_band(),
            gross_margin: default_gross_margin_band(),
        }
    }
}

fn default_roe_band() -> ScoreBand {
    ScoreBand::new(0.0, 0.20, 10.0)
}

fn default_net_margin_band() -> ScoreBand {
    ScoreBand::new(0.0, 0.15, 8.0)
}

fn default_gross_margin_band() -> ScoreBand {
    ScoreBand::new(0.10, 0.40, 7.0)
}

/// Price multiples. Non-positive multiples earn nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationRatioThresholds {
    #[serde(default = "default_pe_band")]
    pub pe_ratio: ScoreBand,
    #[serde(default = "default_pb_band")]
    pub pb_ratio: ScoreBand,
    /// PE divided by growth rate (in percent)
    #[serde(default = "default_peg_band")]
    pub peg: ScoreBand,
}

impl Default for ValuationRatioThresholds {
    fn default() -> Self {
        Self {
            pe_ratio: default_pe_band(),
            pb_ratio: default_pb_band(),
            peg: default_peg_band(),
        }
    }
}

fn default_pe_band() -> ScoreBand {
    ScoreBand::new(25.0, 10.0, 8.0)
}

fn default_pb_band() -> ScoreBand {
    ScoreBand::new(3.0, 1.0, 8.0)
}

fn default_peg_band() -> ScoreBand {
    ScoreBand::new(1.5, 0.8, 9.0)
}

// ============================================================================
// Models, Risk, Screen
// ============================================================================

/// Parameters of the intrinsic value models and of model selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelThresholds {
    /// Premium applied to book value by the asset-based model
    #[serde(default = "default_asset_adjustment")]
    pub asset_adjustment_factor: f64,

    /// Annual discount rate of the earnings-based model (fraction)
    #[serde(default = "default_discount_rate")]
    pub earnings_discount_rate: f64,

    /// Exit multiple applied to projected earnings
    #[serde(default = "default_terminal_pe")]
    pub terminal_pe: f64,

    /// Years of growth the earnings-based model projects
    #[serde(default = "default_projection_years")]
    pub projection_years: u32,

    /// ROE below which earnings are considered unreliable (fraction)
    #[serde(default = "default_min_roe_for_earnings")]
    pub min_roe_for_earnings: f64,

    /// Growth (percent) above which the simple formula overstates value
    #[serde(default = "default_high_growth")]
    pub high_growth_threshold: f64,
}

impl Default for ModelThresholds {
    fn default() -> Self {
        Self {
            asset_adjustment_factor: default_asset_adjustment(),
            earnings_discount_rate: default_discount_rate(),
            terminal_pe: default_terminal_pe(),
            projection_years: default_projection_years(),
            min_roe_for_earnings: default_min_roe_for_earnings(),
            high_growth_threshold: default_high_growth(),
        }
    }
}

fn default_asset_adjustment() -> f64 {
    1.2
}

fn default_discount_rate() -> f64 {
    0.10
}

fn default_terminal_pe() -> f64 {
    15.0
}

fn default_projection_years() -> u32 {
    5
}

fn default_min_roe_for_earnings() -> f64 {
    0.08
}

fn default_high_growth() -> f64 {
    25.0
}

/// Risk classification limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Debt ratio above which risk is high
    #[serde(default = "default_high_debt")]
    pub high_debt_ratio: f64,
    /// Debt ratio at or below which risk can be low
    #[serde(default = "default_low_debt")]
    pub low_debt_ratio: f64,
    /// Current ratio below which risk is high
    #[serde(default = "default_min_current")]
    pub min_current_ratio: f64,
    /// Current ratio required for low risk
    #[serde(default = "default_comfortable_current")]
    pub comfortable_current_ratio: f64,
    /// Quick ratio required for low risk
    #[serde(default = "default_comfortable_quick")]
    pub comfortable_quick_ratio: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            high_debt_ratio: default_high_debt(),
            low_debt_ratio: default_low_debt(),
            min_current_ratio: default_min_current(),
            comfortable_current_ratio: default_comfortable_current(),
            comfortable_quick_ratio: default_comfortable_quick(),
        }
    }
}

fn default_high_debt() -> f64 {
    0.7
}

fn default_low_debt() -> f64 {
    0.4
}

fn default_min_current() -> f64 {
    1.0
}

fn default_comfortable_current() -> f64 {
    1.5
}

fn default_comfortable_quick() -> f64 {
    1.0
}

/// Preliminary Graham screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenThresholds {
    #[serde(default = "default_min_market_cap")]
    pub min_market_cap: f64,
    #[serde(default = "default_max_pe")]
    pub max_pe_ratio: f64,
    #[serde(default = "default_max_pb")]
    pub max_pb_ratio: f64,
    #[serde(default = "default_min_roe")]
    pub min_roe: f64,
    #[serde(default = "default_max_debt")]
    pub max_debt_ratio: f64,
}

impl Default for ScreenThresholds {
    fn default() -> Self {
        Self {
            min_market_cap: default_min_market_cap(),
            max_pe_ratio: default_max_pe(),
            max_pb_ratio: default_max_pb(),
            min_roe: default_min_roe(),
            max_debt_ratio: default_max_debt(),
        }
    }
}

fn default_min_market_cap() -> f64 {
    500_000_000.0
}

fn default_max_pe() -> f64 {
    25.0
}

fn default_max_pb() -> f64 {
    3.0
}

fn default_min_roe() -> f64 {
    0.1
}

fn default_max_debt() -> f64 {
    0.6
}

// ============================================================================
// Root
// ============================================================================

/// Everything the valuation engine is parameterized by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationThresholds {
    #[serde(default)]
    pub financial_health: FinancialHealthThresholds,

    #[serde(default)]
    pub profitability: ProfitabilityThresholds,

    #[serde(default)]
    pub valuation: ValuationRatioThresholds,

    /// Safety margin cut-offs (fractions), highest first
    #[serde(default = "default_margin_tiers")]
    pub safety_margin_tiers: Vec<f64>,

    /// Points awarded at each cut-off in `safety_margin_tiers`
    #[serde(default = "default_margin_scores")]
    pub safety_margin_scores: Vec<f64>,

    #[serde(default)]
    pub models: ModelThresholds,

    #[serde(default)]
    pub risk: RiskThresholds,

    #[serde(default)]
    pub screen: ScreenThresholds,
}

impl Default for ValuationThresholds {
    fn default() -> Self {
        Self {
            financial_health: FinancialHealthThresholds::default(),
            profitability: ProfitabilityThresholds::default(),
            valuation: ValuationRatioThresholds::default(),
            safety_margin_tiers: default_margin_tiers(),
            safety_margin_scores: default_margin_scores(),
            models: ModelThresholds::default(),
            risk: RiskThresholds::default(),
            screen: ScreenThresholds::default(),
        }
    }
}

fn default_margin_tiers() -> Vec<f64> {
    vec![0.5, 0.3, 0.2]
}

fn default_margin_scores() -> Vec<f64> {
    vec![25.0, 18.0, 10.0]
}

impl Validate for ValuationThresholds {
    fn validate(&self) -> ValidationResult<()> {
        let health = &self.financial_health;
        let profit = &self.profitability;
        let ratios = &self.valuation;

        let mut errors = validate_dimension(
            "valuation_thresholds.financial_health",
            &[
                ("current_ratio", &health.current_ratio),
                ("quick_ratio", &health.quick_ratio),
                ("debt_ratio", &health.debt_ratio),
            ],
        );
        errors.extend(validate_dimension(
            "valuation_thresholds.profitability",
            &[
                ("roe", &profit.roe),
                ("net_margin", &profit.net_margin),
                ("gross_margin", &profit.gross_margin),
            ],
        ));
        errors.extend(validate_dimension(
            "valuation_thresholds.valuation",
            &[
                ("pe_ratio", &ratios.pe_ratio),
                ("pb_ratio", &ratios.pb_ratio),
                ("peg", &ratios.peg),
            ],
        ));

        let tiers = &self.safety_margin_tiers;
        let scores = &self.safety_margin_scores;
        if tiers.is_empty() || tiers.len() != scores.len() {
            errors.push(ValidationError::Conflict {
                reason: "safety_margin_tiers and safety_margin_scores must be non-empty and the same length".into(),
            });
        } else {
            if !tiers.iter().all(|t| t.is_finite() && *t > 0.0) || !tiers.windows(2).all(|w| w[0] > w[1]) {
                errors.push(ValidationError::invalid(
                    "valuation_thresholds.safety_margin_tiers",
                    "must be positive and strictly descending",
                ));
            }
            if !scores.iter().all(|s| s.is_finite() && (0.0..=DIMENSION_MAX).contains(s))
                || !scores.windows(2).all(|w| w[0] >= w[1])
            {
                errors.push(ValidationError::invalid(
                    "valuation_thresholds.safety_margin_scores",
                    "must be within [0, 25] and descending",
                ));
            }
        }

        let models = &self.models;
        for (field, value) in [
            ("valuation_thresholds.models.asset_adjustment_factor", models.asset_adjustment_factor),
            ("valuation_thresholds.models.terminal_pe", models.terminal_pe),
        ] {
            if let Err(e) = require_positive(field, value) {
                errors.push(e);
            }
        }
        if let Err(e) = require_range(
            "valuation_thresholds.models.earnings_discount_rate",
            models.earnings_discount_rate,
            0.0,
            1.0,
        ) {
            errors.push(e);
        }

        let risk = &self.risk;
        if risk.low_debt_ratio > risk.high_debt_ratio {
            errors.push(ValidationError::Conflict {
                reason: "risk.low_debt_ratio is above risk.high_debt_ratio".into(),
            });
        }
        if risk.min_current_ratio > risk.comfortable_current_ratio {
            errors.push(ValidationError::Conflict {
                reason: "risk.min_current_ratio is above risk.comfortable_current_ratio".into(),
            });
        }

        ValidationError::collect(errors)
    }
}

// ============================================================================
// Tests
// ============================================================================
