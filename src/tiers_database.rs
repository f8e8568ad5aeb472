use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::{KujiError, KujiResult};
use crate::models::Points;

// --- Tier Definition ---

/// One reward bracket. Weight is relative to the sum of all weights in the table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Tier {
    pub name: String,
    pub weight: u32,
    #[serde(alias = "point")]
    pub point_delta: Points,
    pub items: Vec<String>,
}

impl Tier {
    fn new(name: &str, point_delta: Points, weight: u32, items: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            weight,
            point_delta,
            items: items.iter().map(|item| item.to_string()).collect(),
        }
    }
}

// --- Tier Table ---

/// Ordered, validated, immutable tier list. Table order decides interval
/// placement during sampling, so it is never re-sorted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<Tier>,
    total_weight: u64,
}

impl TierTable {
    /// Validates once; a table that passes here can be sampled without further checks.
    pub fn new(tiers: Vec<Tier>) -> KujiResult<Self> {
        if tiers.is_empty() {
            return Err(KujiError::configuration("tier table is empty"));
        }

        for tier in &tiers {
            if tier.weight == 0 {
                return Err(KujiError::configuration(format!(
                    "tier '{}' has a non-positive weight",
                    tier.name
                )));
            }
            if tier.items.is_empty() {
                return Err(KujiError::configuration(format!(
                    "tier '{}' has an empty item pool",
                    tier.name
                )));
            }
        }
        let total_weight = sum_weights(tiers.iter().map(|tier| u64::from(tier.weight)))
            .ok_or_else(|| KujiError::configuration("total tier weight overflows"))?;

        Ok(Self {
            tiers,
            total_weight,
        })
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Sampling denominator. Always > 0.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|tier| tier.name == name)
    }

    pub fn standard() -> Self {
        Self {
            tiers: DEFAULT_TIERS.clone(),
            total_weight: total_weight_of(&DEFAULT_TIERS),
        }
    }

    pub fn bonus() -> Self {
        Self {
            tiers: BONUS_TIERS.clone(),
            total_weight: total_weight_of(&BONUS_TIERS),
        }
    }
}

fn total_weight_of(tiers: &[Tier]) -> u64 {
    tiers.iter().map(|tier| u64::from(tier.weight)).sum()
}

/// `None` on overflow.
fn sum_weights(mut weights: impl Iterator<Item = u64>) -> Option<u64> {
    weights.try_fold(0u64, |total, weight| total.checked_add(weight))
}

// --- Built-in Tables ---

lazy_static! {
    /// Canonical table: small signed deltas, weights sum to 100.
    pub static ref DEFAULT_TIERS: Vec<Tier> = vec![
        Tier::new("ウルトラ大吉", 50, 1, &["金のりんご", "伝説の剣"]),
        Tier::new("超大吉", 30, 3, &["高級腕時計", "ブランド財布"]),
        Tier::new("大吉", 10, 6, &["スニーカー", "イヤホン"]),
        Tier::new("中吉", 5, 20, &["本", "文房具"]),
        Tier::new("小吉", 3, 35, &["傘", "ハンカチ"]),
        Tier::new("凶", -5, 25, &["石ころ"]),
        Tier::new("大凶", -10, 7, &["割れた鏡"]),
        Tier::new("超大凶", -15, 3, &["呪われた人形"]),
    ];

    /// Higher-payout table used by the half-day boundary variant. Opt-in via config.
    pub static ref BONUS_TIERS: Vec<Tier> = vec![
        Tier::new("ウルトラ大吉", 100, 1, &["金のりんご", "伝説の剣"]),
        Tier::new("超大吉", 70, 3, &["高級腕時計", "ブランド財布"]),
        Tier::new("大吉", 50, 6, &["スニーカー", "イヤホン"]),
        Tier::new("中吉", 30, 15, &["本", "文房具"]),
        Tier::new("小吉", 15, 25, &["傘", "ハンカチ"]),
        Tier::new("凶", 5, 25, &["石ころ"]),
        Tier::new("大凶", 0, 18, &["割れた鏡"]),
        Tier::new("超大凶", -10, 7, &["呪われた人形"]),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_tables_are_valid() {
        let standard = TierTable::new(DEFAULT_TIERS.clone()).unwrap();
        assert_eq!(standard.total_weight(), 100);
        assert_eq!(standard, TierTable::standard());

        let bonus = TierTable::new(BONUS_TIERS.clone()).unwrap();
        assert_eq!(bonus.total_weight(), 100);
        assert_eq!(bonus, TierTable::bonus());
    }

    #[test]
    fn rejects_empty_table() {
        let err = TierTable::new(Vec::new()).unwrap_err();
        assert!(matches!(err, KujiError::Configuration { .. }));
    }

    #[test]
    fn rejects_zero_weight() {
        let tiers = vec![
            Tier::new("ok", 1, 3, &["a"]),
            Tier::new("dead", 1, 0, &["b"]),
        ];
        let err = TierTable::new(tiers).unwrap_err();
        assert!(err.to_string().contains("dead"));
    }

    #[test]
    fn rejects_empty_item_pool() {
        let tiers = vec![Tier::new("hollow", 1, 3, &[])];
        let err = TierTable::new(tiers).unwrap_err();
        assert!(err.to_string().contains("empty item pool"));
    }

    #[test]
    fn weight_sum_overflow_is_detected() {
        assert_eq!(sum_weights([1u64, 2, 3].into_iter()), Some(6));
        assert_eq!(sum_weights([u64::MAX, 1].into_iter()), None);

        let heavy = vec![
            Tier::new("a", 1, u32::MAX, &["x"]),
            Tier::new("b", 1, u32::MAX, &["y"]),
        ];
        assert_eq!(TierTable::new(heavy).unwrap().total_weight(), 2 * u64::from(u32::MAX));
    }

    #[test]
    fn accepts_legacy_point_field_name() {
        let json = r#"[{"name": "大吉", "point": 10, "weight": 6, "items": ["イヤホン"]}]"#;
        let tiers: Vec<Tier> = serde_json::from_str(json).unwrap();
        assert_eq!(tiers[0].point_delta, 10);
        assert!(TierTable::new(tiers).is_ok());
    }
}
