//! Pricing and rating rules.
//!
//! Rules are data rows loaded once per consolidation and evaluated as pure
//! functions over mapped stones. Rows are ordered by priority; the first
//! matching rule wins. A stone with no matching rule keeps its supplier
//! price and gets the neutral rating.

use crate::adapters::MappedStone;

pub const DEFAULT_RATING: i32 = 50;

/// Markup applied to the supplier price when the predicate columns match.
/// `None` predicate columns match anything.
#[derive(Debug, Clone)]
pub struct PricingRule {
    pub shape: Option<String>,
    pub weight_min_points: Option<u32>,
    pub weight_max_points: Option<u32>,
    pub markup_bps: i64,
    pub flat_fee_cents: i64,
    pub priority: i64,
}

impl PricingRule {
    fn matches(&self, stone: &MappedStone) -> bool {
        if let Some(shape) = &self.shape {
            if shape != stone.shape.as_str() {
                return false;
            }
        }
        if let Some(min) = self.weight_min_points {
            if stone.weight_points < min {
                return false;
            }
        }
        if let Some(max) = self.weight_max_points {
            if stone.weight_points > max {
                return false;
            }
        }
        true
    }
}

/// Quality score assigned when the predicate columns match.
#[derive(Debug, Clone)]
pub struct RatingRule {
    pub shape: Option<String>,
    pub color: Option<String>,
    pub clarity: Option<String>,
    pub min_weight_points: Option<u32>,
    pub rating: i64,
    pub priority: i64,
}

impl RatingRule {
    fn matches(&self, stone: &MappedStone) -> bool {
        if let Some(shape) = &self.shape {
            if shape != stone.shape.as_str() {
                return false;
            }
        }
        if let Some(color) = &self.color {
            if color != &stone.color {
                return false;
            }
        }
        if let Some(clarity) = &self.clarity {
            if clarity != &stone.clarity {
                return false;
            }
        }
        if let Some(min) = self.min_weight_points {
            if stone.weight_points < min {
                return false;
            }
        }
        true
    }
}

/// Final sell price in cents. Rules are pre-sorted by priority.
pub fn apply_pricing(stone: &MappedStone, rules: &[PricingRule]) -> i64 {
    let base = stone.supplier_price_cents.max(0);
    match rules.iter().find(|r| r.matches(stone)) {
        Some(rule) => {
            let marked = (base as i128 * (10_000 + rule.markup_bps) as i128) / 10_000;
            (marked as i64 + rule.flat_fee_cents).max(0)
        }
        None => base,
    }
}

/// Quality rating. Rules are pre-sorted by priority.
pub fn apply_rating(stone: &MappedStone, rules: &[RatingRule]) -> i32 {
    match rules.iter().find(|r| r.matches(stone)) {
        Some(rule) => rule.rating.clamp(0, 100) as i32,
        None => DEFAULT_RATING,
    }
}

/// Starter rule set used when a deployment has no rules configured yet.
pub fn default_pricing_rules() -> Vec<PricingRule> {
    vec![
        // Big stones carry a thinner margin.
        PricingRule {
            shape: None,
            weight_min_points: Some(200),
            weight_max_points: None,
            markup_bps: 800,
            flat_fee_cents: 0,
            priority: 10,
        },
        PricingRule {
            shape: None,
            weight_min_points: None,
            weight_max_points: None,
            markup_bps: 1_200,
            flat_fee_cents: 500,
            priority: 100,
        },
    ]
}

pub fn default_rating_rules() -> Vec<RatingRule> {
    vec![
        RatingRule {
            shape: None,
            color: Some("D".into()),
            clarity: Some("FL".into()),
            min_weight_points: None,
            rating: 95,
            priority: 10,
        },
        RatingRule {
            shape: None,
            color: None,
            clarity: None,
            min_weight_points: Some(100),
            rating: 70,
            priority: 50,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Shape, StoneStatus};
    use chrono::Utc;

    fn stone(shape: Shape, weight_points: u32, color: &str, clarity: &str, price: i64) -> MappedStone {
        MappedStone {
            supplier_stone_id: "s1".into(),
            offer_id: "o1".into(),
            shape,
            weight_points,
            color: color.into(),
            clarity: clarity.into(),
            cut: None,
            lab: None,
            certificate: None,
            supplier_price_cents: price,
            status: StoneStatus::Available,
            media_url: None,
            source_updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_matching_pricing_rule_wins() {
        let rules = vec![
            PricingRule {
                shape: Some("round".into()),
                weight_min_points: None,
                weight_max_points: None,
                markup_bps: 1_000,
                flat_fee_cents: 0,
                priority: 1,
            },
            PricingRule {
                shape: None,
                weight_min_points: None,
                weight_max_points: None,
                markup_bps: 2_000,
                flat_fee_cents: 0,
                priority: 2,
            },
        ];

        // Round stone hits the 10% rule, not the 20% catch-all.
        let round = stone(Shape::Round, 100, "F", "VS1", 100_000);
        assert_eq!(apply_pricing(&round, &rules), 110_000);

        let pear = stone(Shape::Pear, 100, "F", "VS1", 100_000);
        assert_eq!(apply_pricing(&pear, &rules), 120_000);
    }

    #[test]
    fn flat_fee_is_added_after_markup() {
        let rules = vec![PricingRule {
            shape: None,
            weight_min_points: None,
            weight_max_points: None,
            markup_bps: 500,
            flat_fee_cents: 1_000,
            priority: 1,
        }];
        let s = stone(Shape::Oval, 150, "G", "VS2", 200_000);
        assert_eq!(apply_pricing(&s, &rules), 211_000);
    }

    #[test]
    fn no_matching_rule_keeps_supplier_price() {
        let rules = vec![PricingRule {
            shape: Some("heart".into()),
            weight_min_points: None,
            weight_max_points: None,
            markup_bps: 9_999,
            flat_fee_cents: 0,
            priority: 1,
        }];
        let s = stone(Shape::Round, 100, "F", "VS1", 50_000);
        assert_eq!(apply_pricing(&s, &rules), 50_000);
    }

    #[test]
    fn weight_bounds_are_inclusive() {
        let rules = vec![PricingRule {
            shape: None,
            weight_min_points: Some(100),
            weight_max_points: Some(200),
            markup_bps: 0,
            flat_fee_cents: 777,
            priority: 1,
        }];
        assert_eq!(apply_pricing(&stone(Shape::Round, 100, "F", "VS1", 0), &rules), 777);
        assert_eq!(apply_pricing(&stone(Shape::Round, 200, "F", "VS1", 0), &rules), 777);
        assert_eq!(apply_pricing(&stone(Shape::Round, 201, "F", "VS1", 0), &rules), 0);
    }

    #[test]
    fn rating_falls_back_to_neutral() {
        let top = stone(Shape::Round, 50, "D", "FL", 0);
        let plain = stone(Shape::Round, 50, "J", "SI2", 0);
        let rules = default_rating_rules();

        assert_eq!(apply_rating(&top, &rules), 95);
        assert_eq!(apply_rating(&plain, &rules), DEFAULT_RATING);
    }

    #[test]
    fn rating_is_clamped() {
        let rules = vec![RatingRule {
            shape: None,
            color: None,
            clarity: None,
            min_weight_points: None,
            rating: 400,
            priority: 1,
        }];
        assert_eq!(apply_rating(&stone(Shape::Round, 50, "F", "VS1", 0), &rules), 100);
    }
}
