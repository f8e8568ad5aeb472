// src/draw.rs
//
// Weighted draw over the tier table. Tiers partition [0, W) into contiguous
// half-open intervals in table order; a uniform roll in [0, W) lands in
// exactly one of them.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{KujiError, KujiResult};
use crate::models::{DrawOutcome, TierRate};
use crate::tiers_database::TierTable;

#[derive(Clone, Debug)]
pub struct DrawEngine {
    table: TierTable,
    index: WeightedIndex<u64>,
}

impl DrawEngine {
    pub fn new(table: TierTable) -> KujiResult<Self> {
        let index = WeightedIndex::new(table.tiers().iter().map(|tier| u64::from(tier.weight)))
            .map_err(|e| KujiError::configuration(format!("unusable tier weights: {}", e)))?;
        Ok(Self { table, index })
    }

    pub fn table(&self) -> &TierTable {
        &self.table
    }

    pub fn draw(&self) -> DrawOutcome {
        self.draw_with(&mut rand::thread_rng())
    }

    pub fn draw_with<R: Rng + ?Sized>(&self, rng: &mut R) -> DrawOutcome {
        let tier = &self.table.tiers()[self.index.sample(rng)];
        // Item pools are non-empty once the table has been validated.
        let item = tier.items.choose(rng).cloned().unwrap_or_default();

        DrawOutcome {
            tier_name: tier.name.clone(),
            point_delta: tier.point_delta,
            item,
        }
    }

    pub fn rates(&self) -> Vec<TierRate> {
        let total = self.table.total_weight() as f64;
        self.table
            .tiers()
            .iter()
            .map(|tier| TierRate {
                name: tier.name.clone(),
                point_delta: tier.point_delta,
                weight: tier.weight,
                probability: f64::from(tier.weight) / total,
            })
            .collect()
    }
}
