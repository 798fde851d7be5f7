//! Pod label sets, the interning cache and selector matching

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Raw label map as reported for a pod
pub type Labels = BTreeMap<String, String>;

/// Immutable, shareable label set
///
/// Identity is the canonical fingerprint (`k1=v1,k2=v2`, keys sorted), so two
/// sets holding the same pairs compare equal regardless of insertion order.
#[derive(Clone)]
pub struct LabelSet {
    fingerprint: Arc<str>,
    labels: Arc<Labels>,
}

impl LabelSet {
    pub fn new(labels: Labels) -> Self {
        Self {
            fingerprint: fingerprint(&labels).into(),
            labels: Arc::new(labels),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// True when both handles point at the same allocation
    pub fn shares_storage_with(&self, other: &LabelSet) -> bool {
        Arc::ptr_eq(&self.labels, &other.labels)
    }
}

impl PartialEq for LabelSet {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for LabelSet {}

impl Hash for LabelSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Debug for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.fingerprint)
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

fn fingerprint(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Interning table so that keys sharing a label combination share one allocation
#[derive(Debug, Default)]
pub struct LabelSetCache {
    sets: HashMap<Arc<str>, LabelSet>,
}

impl LabelSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared handle for `labels`, storing it on first use
    pub fn intern(&mut self, labels: &Labels) -> LabelSet {
        let key = fingerprint(labels);
        if let Some(existing) = self.sets.get(key.as_str()) {
            return existing.clone();
        }
        let set = LabelSet::new(labels.clone());
        self.sets.insert(set.fingerprint.clone(), set.clone());
        set
    }

    /// Drop every cached set whose fingerprint is not in `in_use`
    pub fn retain_in_use(&mut self, in_use: &HashSet<&str>) -> usize {
        let before = self.sets.len();
        self.sets.retain(|fingerprint, _| in_use.contains(fingerprint.as_ref()));
        before - self.sets.len()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Capability to decide whether a pod's labels fall under a VPA
pub trait PodSelector: Send + Sync + fmt::Debug {
    fn matches(&self, labels: &Labels) -> bool;

    /// Stable textual form, used to detect selector changes
    fn fingerprint(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Kubernetes-style label selector (`matchLabels` plus `matchExpressions`)
///
/// An empty selector matches every label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: Labels,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    pub fn from_labels<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn with_requirement(mut self, requirement: SelectorRequirement) -> Self {
        self.match_expressions.push(requirement);
        self
    }
}

impl PodSelector for LabelSelector {
    fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for requirement in &self.match_expressions {
            let mut values = requirement.values.clone();
            values.sort();
            parts.push(format!(
                "{} {:?} ({})",
                requirement.key,
                requirement.operator,
                values.join(",")
            ));
        }
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_label_set_equality_ignores_order() {
        let mut a = Labels::new();
        a.insert("tier".into(), "web".into());
        a.insert("app".into(), "foo".into());
        let b = labels(&[("app", "foo"), ("tier", "web")]);

        assert_eq!(LabelSet::new(a), LabelSet::new(b));
        assert_ne!(
            LabelSet::new(labels(&[("app", "foo")])),
            LabelSet::new(labels(&[("app", "bar")]))
        );
        assert_eq!(
            LabelSet::new(labels(&[("app", "foo"), ("tier", "web")])).fingerprint(),
            "app=foo,tier=web"
        );
    }

    #[test]
    fn test_cache_shares_allocations() {
        let mut cache = LabelSetCache::new();
        let first = cache.intern(&labels(&[("app", "foo")]));
        let second = cache.intern(&labels(&[("app", "foo")]));
        let other = cache.intern(&labels(&[("app", "bar")]));

        assert!(first.shares_storage_with(&second));
        assert!(!first.shares_storage_with(&other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_retain_in_use() {
        let mut cache = LabelSetCache::new();
        let keep = cache.intern(&labels(&[("app", "foo")]));
        cache.intern(&labels(&[("app", "bar")]));

        let in_use: HashSet<&str> = [keep.fingerprint()].into_iter().collect();
        assert_eq!(cache.retain_in_use(&in_use), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.intern(&labels(&[("app", "foo")])).shares_storage_with(&keep));
    }

    #[test]
    fn test_match_labels_selector() {
        let selector = LabelSelector::from_labels([("app", "foo")]);
        assert!(selector.matches(&labels(&[("app", "foo"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("app", "bar")])));
        assert!(!selector.matches(&Labels::new()));
        assert!(LabelSelector::default().matches(&labels(&[("anything", "goes")])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector::default()
            .with_requirement(SelectorRequirement {
                key: "env".into(),
                operator: SelectorOperator::In,
                values: vec!["prod".into(), "staging".into()],
            })
            .with_requirement(SelectorRequirement {
                key: "canary".into(),
                operator: SelectorOperator::DoesNotExist,
                values: vec![],
            });

        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("canary", "true")])));

        let not_in = LabelSelector::default().with_requirement(SelectorRequirement {
            key: "env".into(),
            operator: SelectorOperator::NotIn,
            values: vec!["prod".into()],
        });
        assert!(not_in.matches(&Labels::new()));
        assert!(!not_in.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_selector_fingerprint_is_stable() {
        let a = LabelSelector::from_labels([("b", "2"), ("a", "1")]);
        let b = LabelSelector::from_labels([("a", "1"), ("b", "2")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(
            a.fingerprint(),
            LabelSelector::from_labels([("a", "1")]).fingerprint()
        );
    }
}
