use model::unit::{Coordinate, Dimension, PartitionRanges, WorkUnit};
use std::collections::BTreeMap;
use tracing::debug;

/// Expands `ranges` into the full cross-product of its dimensions.
///
/// Output order is deterministic: the first dimension varies slowest. No
/// dimensions, or any dimension with an empty domain, yields no units.
pub fn partition(ranges: &PartitionRanges) -> Vec<WorkUnit> {
    if ranges.dimensions.is_empty() || ranges.dimensions.iter().any(Dimension::is_empty) {
        debug!(
            dimensions = ranges.dimensions.len(),
            "Partition has an empty domain, no units produced"
        );
        return Vec::new();
    }

    let mut prefixes: Vec<Vec<Coordinate>> = vec![Vec::new()];
    for dimension in &ranges.dimensions {
        let mut next = Vec::with_capacity(prefixes.len().saturating_mul(dimension.len()));
        for prefix in &prefixes {
            for value in &dimension.values {
                let mut coords = prefix.clone();
                coords.push(Coordinate {
                    dimension: dimension.name.clone(),
                    value: value.clone(),
                });
                next.push(coords);
            }
        }
        prefixes = next;
    }

    prefixes.into_iter().map(WorkUnit::new).collect()
}

/// Units of the partition whose key is not in `completed`.
pub fn remaining<V>(ranges: &PartitionRanges, completed: &BTreeMap<String, V>) -> Vec<WorkUnit> {
    partition(ranges)
        .into_iter()
        .filter(|unit| !completed.contains_key(&unit.key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn catalog() -> PartitionRanges {
        PartitionRanges::default()
            .with(Dimension::new("language", ["en", "de"]))
            .with(Dimension::years(2021, 2023))
            .with(Dimension::new("category", ["film", "series"]))
    }

    #[test]
    fn produces_every_combination_once() {
        let units = partition(&catalog());
        assert_eq!(units.len(), 2 * 3 * 2);

        let keys: HashSet<String> = units.iter().map(WorkUnit::key).collect();
        assert_eq!(keys.len(), units.len());
    }

    #[test]
    fn first_dimension_varies_slowest() {
        let units = partition(&catalog());
        assert_eq!(units[0].key(), "en|2021|film");
        assert_eq!(units[1].key(), "en|2021|series");
        assert_eq!(units[2].key(), "en|2022|film");
        assert_eq!(units[6].key(), "de|2021|film");
        assert_eq!(units[11].key(), "de|2023|series");
    }

    #[test]
    fn output_is_deterministic() {
        assert_eq!(partition(&catalog()), partition(&catalog()));
    }

    #[test]
    fn empty_domain_yields_empty_partition() {
        let ranges = PartitionRanges::default()
            .with(Dimension::new("language", ["en"]))
            .with(Dimension::years(2024, 2020));
        assert!(partition(&ranges).is_empty());
        assert!(partition(&PartitionRanges::default()).is_empty());
    }

    #[test]
    fn remaining_skips_completed_keys() {
        let ranges = PartitionRanges::default().with(Dimension::new("letter", ["A", "B", "C", "D"]));
        let completed: BTreeMap<String, ()> =
            [("A".to_string(), ()), ("B".to_string(), ())].into_iter().collect();

        let keys: Vec<String> = remaining(&ranges, &completed)
            .iter()
            .map(WorkUnit::key)
            .collect();
        assert_eq!(keys, vec!["C", "D"]);
    }
}
