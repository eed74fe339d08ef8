//! Static series → category table
//!
//! Lookup is exact match first, then the longest matching prefix for
//! families that span several series. Unknown series classify to `None`.

use services_common::Category;

/// How a table row matches a series ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesMatch {
    /// Whole series ticker
    Exact(&'static str),
    /// Any series starting with this prefix
    Prefix(&'static str),
}

/// One row of the classification table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesRule {
    /// Match criterion
    pub pattern: SeriesMatch,
    /// Resulting category
    pub category: Category,
    /// Whether discovery lists this series directly
    pub queried: bool,
}

const fn exact(series: &'static str, category: Category) -> SeriesRule {
    SeriesRule {
        pattern: SeriesMatch::Exact(series),
        category,
        queried: true,
    }
}

const fn family(prefix: &'static str, category: Category) -> SeriesRule {
    SeriesRule {
        pattern: SeriesMatch::Prefix(prefix),
        category,
        queried: false,
    }
}

/// Ordered classification table
pub static SERIES_TABLE: &[SeriesRule] = &[
    exact("KXNFLGAME", Category::Nfl),
    exact("KXNHLGAME", Category::Nhl),
    exact("KXNBAGAME", Category::Nba),
    exact("KXNCAAFGAME", Category::Ncaaf),
    exact("KXHIGHNY", Category::Weather),
    exact("KXHIGHCHI", Category::Weather),
    exact("KXHIGHMIA", Category::Weather),
    exact("KXHIGHAUS", Category::Weather),
    exact("KXHIGHDEN", Category::Weather),
    exact("KXHIGHLAX", Category::Weather),
    exact("KXRAINNYC", Category::Weather),
    family("KXNFL", Category::Nfl),
    family("KXNHL", Category::Nhl),
    family("KXNBA", Category::Nba),
    family("KXNCAAF", Category::Ncaaf),
    family("KXHIGH", Category::Weather),
    family("KXLOW", Category::Weather),
    family("KXRAIN", Category::Weather),
    family("KXSNOW", Category::Weather),
];

/// Classify a series ticker
#[must_use]
pub fn classify(series: &str) -> Option<Category> {
    classify_with(SERIES_TABLE, series)
}

/// Classify against an arbitrary table
#[must_use]
pub fn classify_with(table: &[SeriesRule], series: &str) -> Option<Category> {
    let series = series.trim();
    if series.is_empty() {
        return None;
    }

    let exact = table.iter().find_map(|rule| match rule.pattern {
        SeriesMatch::Exact(key) if key.eq_ignore_ascii_case(series) => Some(rule.category),
        _ => None,
    });
    if exact.is_some() {
        return exact;
    }

    let upper = series.to_ascii_uppercase();
    table
        .iter()
        .filter_map(|rule| match rule.pattern {
            SeriesMatch::Prefix(prefix) if upper.starts_with(prefix) => {
                Some((prefix.len(), rule.category))
            }
            _ => None,
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, category)| category)
}

/// Classify a market ticker by its series component
///
/// Market tickers look like `SERIES-EVENT-OUTCOME`.
#[must_use]
pub fn classify_ticker(ticker: &str) -> Option<Category> {
    let series = ticker.split('-').next().unwrap_or(ticker);
    classify(series)
}

/// Series listed directly when discovering a category
#[must_use]
pub fn query_series(category: Category) -> Vec<&'static str> {
    SERIES_TABLE
        .iter()
        .filter(|rule| rule.queried && rule.category == category)
        .filter_map(|rule| match rule.pattern {
            SeriesMatch::Exact(series) => Some(series),
            SeriesMatch::Prefix(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("KXNFLGAME", Some(Category::Nfl))]
    #[case("kxnhlgame", Some(Category::Nhl))]
    #[case("KXNCAAFGAME", Some(Category::Ncaaf))]
    #[case("KXNFLSPREAD", Some(Category::Nfl))]
    #[case("KXHIGHSEA", Some(Category::Weather))]
    #[case("KXLOWNY", Some(Category::Weather))]
    #[case("KXRAINNYC", Some(Category::Weather))]
    #[case("KXBTC", None)]
    #[case("", None)]
    fn test_classify(#[case] series: &str, #[case] expected: Option<Category>) {
        assert_eq!(classify(series), expected);
    }

    #[test]
    fn test_exact_match_wins_over_prefix() {
        let table = [
            SeriesRule {
                pattern: SeriesMatch::Prefix("KXNFL"),
                category: Category::Nfl,
                queried: false,
            },
            SeriesRule {
                pattern: SeriesMatch::Exact("KXNFLWEATHER"),
                category: Category::Weather,
                queried: true,
            },
        ];
        assert_eq!(classify_with(&table, "KXNFLWEATHER"), Some(Category::Weather));
        assert_eq!(classify_with(&table, "KXNFLTOTAL"), Some(Category::Nfl));
    }

    #[test]
    fn test_classify_ticker_uses_series_component() {
        assert_eq!(classify_ticker("KXNBAGAME-25JAN05LALBOS-LAL"), Some(Category::Nba));
        assert_eq!(classify_ticker("KXHIGHNY-25JAN05-B40"), Some(Category::Weather));
        assert_eq!(classify_ticker("INXD-25JAN05"), None);
    }

    #[test]
    fn test_query_series_per_category() {
        assert_eq!(query_series(Category::Nfl), vec!["KXNFLGAME"]);
        assert!(query_series(Category::Weather).len() >= 6);
        assert!(query_series(Category::Weather).iter().all(|s| s.starts_with("KX")));
    }
}
