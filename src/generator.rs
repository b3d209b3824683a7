//! Puzzle layout generation.
//!
//! A layout shows `amount` icons drawn from two or three distinct icon ids.
//! One id (the correct one) appears strictly fewer times than every other id.

use crate::config::ChallengeOptions;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound for how often the correct icon may appear.
pub fn max_lowest_count(icon_amount: u32) -> u32 {
    match icon_amount {
        5 | 6 => 2,
        7 | 8 => 3,
        _ => 1,
    }
}

/// Split the slots left after placing the correct icon into one or two
/// groups, each strictly larger than `smallest`.
///
/// An even split is preferred; odd remainders split into floor and ceil.
/// When a split would produce a group not larger than `smallest`, the
/// remainder stays a single group.
pub fn calculate_icon_amounts(icon_count: u32, smallest: u32) -> Vec<u32> {
    let remainder = icon_count.saturating_sub(smallest);
    let low = remainder / 2;
    let high = remainder - low;

    if low > smallest {
        vec![low, high]
    } else {
        vec![remainder]
    }
}

/// A generated puzzle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconLayout {
    /// Position (1-based) to icon id.
    pub icons: BTreeMap<u32, u32>,
    pub icon_ids: BTreeSet<u32>,
    pub correct_id: u32,
}

impl IconLayout {
    pub fn amount(&self) -> u32 {
        self.icons.len() as u32
    }

    /// How often each icon id appears.
    pub fn occurrences(&self) -> BTreeMap<u32, u32> {
        let mut counts = BTreeMap::new();
        for id in self.icons.values() {
            *counts.entry(*id).or_insert(0) += 1;
        }
        counts
    }

    /// Positions showing `icon_id`, in ascending order.
    pub fn positions_of(&self, icon_id: u32) -> Vec<u32> {
        self.icons
            .iter()
            .filter(|(_, id)| **id == icon_id)
            .map(|(pos, _)| *pos)
            .collect()
    }
}

/// Draw an icon id from `1..=available` that is not in `used`.
fn pick_unique_icon<R: Rng + ?Sized>(rng: &mut R, available: u32, used: &mut BTreeSet<u32>) -> u32 {
    loop {
        let candidate = rng.gen_range(1..=available);
        if used.insert(candidate) {
            return candidate;
        }
    }
}

/// Generate a layout within the configured bounds.
pub fn generate_layout<R: Rng + ?Sized>(rng: &mut R, options: &ChallengeOptions) -> IconLayout {
    let bounds = options.icon_amount;
    let amount = rng.gen_range(bounds.min..=bounds.max);
    generate_layout_with_amount(rng, amount, options.available_icons)
}

/// Generate a layout of exactly `amount` icons.
pub fn generate_layout_with_amount<R: Rng + ?Sized>(
    rng: &mut R,
    amount: u32,
    available_icons: u32,
) -> IconLayout {
    let correct_amount = rng.gen_range(1..=max_lowest_count(amount));
    let groups = calculate_icon_amounts(amount, correct_amount);

    let mut used = BTreeSet::new();
    let correct_id = pick_unique_icon(rng, available_icons, &mut used);

    let mut slots: Vec<u32> = vec![correct_id; correct_amount as usize];
    for group in groups {
        let id = pick_unique_icon(rng, available_icons, &mut used);
        slots.extend(std::iter::repeat(id).take(group as usize));
    }
    slots.shuffle(rng);

    let icons = slots
        .into_iter()
        .enumerate()
        .map(|(idx, id)| (idx as u32 + 1, id))
        .collect();

    IconLayout {
        icons,
        icon_ids: used,
        correct_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IconAmount;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_valid(layout: &IconLayout, amount: u32) {
        assert_eq!(layout.amount(), amount);
        assert_eq!(
            layout.icons.keys().copied().collect::<Vec<_>>(),
            (1..=amount).collect::<Vec<_>>()
        );

        let occurrences = layout.occurrences();
        assert!(matches!(occurrences.len(), 2 | 3));
        assert_eq!(occurrences.values().sum::<u32>(), amount);
        assert_eq!(
            occurrences.keys().copied().collect::<BTreeSet<_>>(),
            layout.icon_ids
        );

        let min = *occurrences.values().min().unwrap();
        let at_min: Vec<_> = occurrences.iter().filter(|(_, c)| **c == min).collect();
        assert_eq!(at_min.len(), 1);
        assert_eq!(*at_min[0].0, layout.correct_id);
    }

    #[test]
    fn test_max_lowest_count() {
        assert_eq!(max_lowest_count(5), 2);
        assert_eq!(max_lowest_count(6), 2);
        assert_eq!(max_lowest_count(7), 3);
        assert_eq!(max_lowest_count(8), 3);
    }

    #[test]
    fn test_calculate_icon_amounts_cases() {
        assert_eq!(calculate_icon_amounts(5, 1), vec![2, 2]);
        assert_eq!(calculate_icon_amounts(5, 2), vec![3]);
        assert_eq!(calculate_icon_amounts(6, 1), vec![2, 3]);
        assert_eq!(calculate_icon_amounts(6, 2), vec![4]);
        assert_eq!(calculate_icon_amounts(7, 1), vec![3, 3]);
        assert_eq!(calculate_icon_amounts(7, 2), vec![5]);
        assert_eq!(calculate_icon_amounts(7, 3), vec![4]);
        assert_eq!(calculate_icon_amounts(8, 1), vec![3, 4]);
        assert_eq!(calculate_icon_amounts(8, 3), vec![5]);
    }

    #[test]
    fn test_calculate_icon_amounts_invariants() {
        for amount in 5..=8 {
            for smallest in 1..=max_lowest_count(amount) {
                let groups = calculate_icon_amounts(amount, smallest);
                assert_eq!(groups.iter().sum::<u32>(), amount - smallest);
                assert!(groups.iter().all(|g| *g > smallest), "{amount}/{smallest}: {groups:?}");
            }
        }
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let options = ChallengeOptions::default();
        let a = generate_layout(&mut StdRng::seed_from_u64(7), &options);
        let b = generate_layout(&mut StdRng::seed_from_u64(7), &options);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fixed_amount_bounds() {
        let options = ChallengeOptions {
            icon_amount: IconAmount { min: 5, max: 5 },
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..50 {
            let layout = generate_layout(&mut rng, &options);
            assert_valid(&layout, 5);
            assert!(layout.icon_ids.iter().all(|id| (1..=180).contains(id)));
        }
    }

    #[test]
    fn test_tiny_icon_pool() {
        let mut rng = StdRng::seed_from_u64(3);
        let layout = generate_layout_with_amount(&mut rng, 8, 3);
        assert_valid(&layout, 8);
        assert!(layout.icon_ids.iter().all(|id| (1..=3).contains(id)));
    }

    proptest! {
        #[test]
        fn prop_layout_has_unique_minimum(seed in any::<u64>(), amount in 5u32..=8) {
            let mut rng = StdRng::seed_from_u64(seed);
            let layout = generate_layout_with_amount(&mut rng, amount, 180);
            assert_valid(&layout, amount);
        }
    }
}
