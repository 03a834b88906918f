//! Boolean filter-group evaluation.
//!
//! Filters are grouped twice: filters within a group are joined by the
//! group's combinator, and group verdicts are joined by the processed feed's
//! group-level operator for that usage. Both levels share one expression
//! tree and one recursive evaluator.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{NormalizedEntry, ProcessedFeed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    /// Every filter must match.
    All,
    /// At least one filter must match.
    Any,
    /// True iff no filter matches.
    None,
}

impl Combinator {
    pub(crate) fn any() -> Self {
        Combinator::Any
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterUsage {
    /// Gates whether an entry is ingested at all.
    FeedFilter,
    /// Gates whether an ingested article is eligible for AI summarization.
    SummaryFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Title,
    Content,
    TitleOrContent,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Contains,
    DoesNotContain,
    MatchesRegex,
    DoesNotMatchRegex,
    ShorterThan,
    LongerThan,
}

/// A single field predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: FilterField,
    pub match_type: MatchKind,
    pub value: String,
}

/// A named, combinator-joined set of filters tagged with its usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub name: String,
    pub usage: FilterUsage,
    #[serde(default = "Combinator::any")]
    pub relational_operator: Combinator,
    #[serde(default, rename = "filter")]
    pub filters: Vec<Filter>,
}

/// Expression tree over filters: a leaf is one predicate, a node combines
/// child verdicts. Group-of-groups evaluation is the same node type twice.
enum FilterExpr<'a> {
    Leaf(&'a Filter),
    Node {
        op: Combinator,
        children: Vec<FilterExpr<'a>>,
    },
}

impl FilterExpr<'_> {
    fn eval(&self, entry: &NormalizedEntry) -> bool {
        match self {
            FilterExpr::Leaf(filter) => match_filter(entry, filter),
            FilterExpr::Node { op, children } => {
                let mut verdicts = children.iter().map(|c| c.eval(entry));
                match op {
                    Combinator::All => verdicts.all(|v| v),
                    Combinator::Any => verdicts.any(|v| v),
                    Combinator::None => !verdicts.any(|v| v),
                }
            }
        }
    }
}

/// Whether `entry` passes the feed's filter groups of the given usage.
///
/// A feed with no groups for a usage vacuously passes.
pub fn passes_filters(entry: &NormalizedEntry, feed: &ProcessedFeed, usage: FilterUsage) -> bool {
    let groups: Vec<&FilterGroup> = feed
        .filter_groups
        .iter()
        .filter(|g| g.usage == usage)
        .collect();
    if groups.is_empty() {
        return true;
    }

    let op = match usage {
        FilterUsage::FeedFilter => feed.feed_group_relational_operator,
        FilterUsage::SummaryFilter => feed.summary_group_relational_operator,
    };

    let tree = FilterExpr::Node {
        op,
        children: groups
            .iter()
            .map(|g| FilterExpr::Node {
                op: g.relational_operator,
                children: g.filters.iter().map(FilterExpr::Leaf).collect(),
            })
            .collect(),
    };

    tree.eval(entry)
}

/// Evaluate one predicate against the entry's extracted field content.
///
/// An absent or empty target field never matches; the link field always has
/// content.
fn match_filter(entry: &NormalizedEntry, filter: &Filter) -> bool {
    let mut content = String::new();
    match filter.field {
        FilterField::Title => {
            content.push_str(&entry.title);
        }
        FilterField::Content => {
            content.push_str(&entry.content);
        }
        FilterField::TitleOrContent => {
            content.push_str(&entry.title);
            content.push(' ');
            content.push_str(&entry.content);
        }
        FilterField::Link => {
            content = entry.link.clone();
        }
    }
    if content.trim().is_empty() {
        return false;
    }

    match filter.match_type {
        MatchKind::Contains => content.contains(&filter.value),
        MatchKind::DoesNotContain => !content.contains(&filter.value),
        MatchKind::MatchesRegex => match Regex::new(&filter.value) {
            Ok(re) => re.is_match(&content),
            Err(e) => {
                warn!("invalid filter regex {:?}: {}", filter.value, e);
                false
            }
        },
        MatchKind::DoesNotMatchRegex => match Regex::new(&filter.value) {
            Ok(re) => !re.is_match(&content),
            Err(e) => {
                warn!("invalid filter regex {:?}: {}", filter.value, e);
                false
            }
        },
        MatchKind::ShorterThan => match filter.value.trim().parse::<usize>() {
            Ok(n) => content.chars().count() < n,
            Err(_) => false,
        },
        MatchKind::LongerThan => match filter.value.trim().parse::<usize>() {
            Ok(n) => content.chars().count() > n,
            Err(_) => false,
        },
    }
}
