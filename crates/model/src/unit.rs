use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used when building the structural key of a work unit.
pub const KEY_SEPARATOR: char = '|';

/// One categorical axis of a partitioned job, e.g. `language = [en, de]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<String>,
}

impl Dimension {
    /// Builds a dimension, dropping repeated values while keeping the first occurrence.
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for value in values.into_iter().map(Into::into) {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }

        Dimension {
            name: name.into(),
            values: unique,
        }
    }

    /// Inclusive year range. An inverted range yields an empty domain.
    pub fn years(from: i32, to: i32) -> Self {
        Dimension::new("year", (from..=to).map(|year| year.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// Declarative description of a partitioned job: the ordered set of dimensions
/// whose cross-product forms the work units. The first dimension varies slowest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionRanges {
    pub dimensions: Vec<Dimension>,
}

impl PartitionRanges {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        PartitionRanges { dimensions }
    }

    pub fn with(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    /// Number of units the cross-product will contain.
    pub fn unit_count(&self) -> usize {
        if self.dimensions.is_empty() {
            return 0;
        }
        self.dimensions
            .iter()
            .map(Dimension::len)
            .fold(1usize, usize::saturating_mul)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub dimension: String,
    pub value: String,
}

/// The atomic, independently retryable slice of a partitioned job.
///
/// Identity is structural: two units are the same unit iff every coordinate matches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    coords: Vec<Coordinate>,
}

impl WorkUnit {
    pub fn new(coords: Vec<Coordinate>) -> Self {
        WorkUnit { coords }
    }

    /// Convenience constructor from `(dimension, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        WorkUnit {
            coords: pairs
                .into_iter()
                .map(|(dimension, value)| Coordinate {
                    dimension: dimension.into(),
                    value: value.into(),
                })
                .collect(),
        }
    }

    pub fn coords(&self) -> &[Coordinate] {
        &self.coords
    }

    /// Value of a named dimension, if the unit has it.
    pub fn value(&self, dimension: &str) -> Option<&str> {
        self.coords
            .iter()
            .find(|c| c.dimension == dimension)
            .map(|c| c.value.as_str())
    }

    /// Structural key used for set membership in the ledger.
    ///
    /// Separators and backslashes inside values are escaped so distinct
    /// units never share a key.
    pub fn key(&self) -> String {
        let mut key = String::new();
        for (idx, coord) in self.coords.iter().enumerate() {
            if idx > 0 {
                key.push(KEY_SEPARATOR);
            }
            for ch in coord.value.chars() {
                if ch == KEY_SEPARATOR || ch == '\\' {
                    key.push('\\');
                }
                key.push(ch);
            }
        }
        key
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_values_in_dimension_order() {
        let unit = WorkUnit::from_pairs([("language", "en"), ("year", "2021"), ("category", "film")]);
        assert_eq!(unit.key(), "en|2021|film");
        assert_eq!(unit.value("year"), Some("2021"));
        assert_eq!(unit.value("missing"), None);
    }

    #[test]
    fn separator_inside_value_does_not_collide() {
        let a = WorkUnit::from_pairs([("a", "x|y"), ("b", "z")]);
        let b = WorkUnit::from_pairs([("a", "x"), ("b", "y|z")]);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), "x\\|y|z");
    }

    #[test]
    fn equality_is_structural() {
        let a = WorkUnit::from_pairs([("language", "en"), ("year", "2021")]);
        let b = WorkUnit::from_pairs([("language", "en"), ("year", "2021")]);
        let c = WorkUnit::from_pairs([("language", "en"), ("year", "2022")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dimension_drops_repeated_values() {
        let dim = Dimension::new("language", ["en", "de", "en"]);
        assert_eq!(dim.values, vec!["en".to_string(), "de".to_string()]);
    }

    #[test]
    fn inverted_year_range_is_empty() {
        assert!(Dimension::years(2024, 2020).is_empty());
        assert_eq!(Dimension::years(2020, 2024).len(), 5);
    }

    #[test]
    fn unit_count_is_product_of_domains() {
        let ranges = PartitionRanges::default()
            .with(Dimension::new("language", ["en", "de"]))
            .with(Dimension::years(2020, 2022))
            .with(Dimension::new("category", ["film"]));
        assert_eq!(ranges.unit_count(), 6);
        assert_eq!(PartitionRanges::default().unit_count(), 0);
    }
}
