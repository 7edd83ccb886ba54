use crate::ALL;
use mig_discovery_k8s_api::{PolicyRule, ResourceAttributes};

/// An access request: every combination of its API groups, resources and verbs must be allowed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Review {
    pub groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// One (group, resource, verb) combination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxItem {
    pub group: String,
    pub resource: String,
    pub verb: String,
    matched: bool,
}

/// The expansion of a [`Review`], tracking which items some rule has matched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Matrix {
    items: Vec<MxItem>,
    name: Option<String>,
}

// === impl Review ===

impl Review {
    pub fn new<G, R, V>(
        groups: impl IntoIterator<Item = G>,
        resources: impl IntoIterator<Item = R>,
        verbs: impl IntoIterator<Item = V>,
    ) -> Self
    where
        G: Into<String>,
        R: Into<String>,
        V: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
            verbs: verbs.into_iter().map(Into::into).collect(),
            namespace: None,
            name: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The review as a set of access review attributes, one per matrix item.
    ///
    /// Resources of the form `resource/subresource` are split.
    pub fn attributes(&self) -> Vec<ResourceAttributes> {
        Matrix::expand(self)
            .items
            .into_iter()
            .map(|item| {
                let (resource, subresource) = match item.resource.split_once('/') {
                    Some((r, s)) => (r.to_string(), Some(s.to_string())),
                    None => (item.resource, None),
                };
                ResourceAttributes {
                    group: Some(item.group),
                    resource: Some(resource),
                    subresource,
                    verb: Some(item.verb),
                    namespace: self.namespace.clone(),
                    name: self.name.clone(),
                    ..Default::default()
                }
            })
            .collect()
    }
}

// === impl MxItem ===

impl MxItem {
    pub fn new(
        group: impl Into<String>,
        resource: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            verb: verb.into(),
            matched: false,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.matched
    }

    /// True when `rule` grants this item.
    ///
    /// A concrete value is granted by an equal value or by a wildcard. A wildcard is granted only
    /// by a wildcard: a rule enumerating every concrete value does not grant it.
    pub fn matches(&self, rule: &MxItem) -> bool {
        fn field(needed: &str, granted: &str) -> bool {
            if needed == ALL {
                return granted == ALL;
            }
            needed == granted || granted == ALL
        }

        field(&self.group, &rule.group)
            && field(&self.resource, &rule.resource)
            && field(&self.verb, &rule.verb)
    }
}

// === impl Matrix ===

impl Matrix {
    pub fn expand(review: &Review) -> Self {
        Self {
            items: product(&review.groups, &review.resources, &review.verbs),
            name: review.name.clone(),
        }
    }

    pub fn items(&self) -> &[MxItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Marks the items granted by `rule`. Items stay matched across rules.
    ///
    /// A rule restricted to `resourceNames` grants nothing to a request without a name.
    pub fn apply(&mut self, rule: &PolicyRule) {
        if let Some(names) = rule.resource_names.as_ref().filter(|n| !n.is_empty()) {
            match &self.name {
                Some(name) if names.contains(name) => {}
                _ => return,
            }
        }
        let granted = product(
            rule.api_groups.as_deref().unwrap_or_default(),
            rule.resources.as_deref().unwrap_or_default(),
            &rule.verbs,
        );
        for needed in self.items.iter_mut().filter(|i| !i.matched) {
            needed.matched = granted.iter().any(|g| needed.matches(g));
        }
    }

    /// True when every item has been matched. An empty matrix is never satisfied.
    pub fn is_satisfied(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.matched)
    }
}

fn product(groups: &[String], resources: &[String], verbs: &[String]) -> Vec<MxItem> {
    let mut items = Vec::with_capacity(groups.len() * resources.len() * verbs.len());
    for group in groups {
        for resource in resources {
            for verb in verbs {
                items.push(MxItem::new(group, resource, verb));
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
        let strings = |s: &[&str]| s.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        PolicyRule {
            api_groups: Some(strings(groups)),
            resources: Some(strings(resources)),
            verbs: strings(verbs),
            ..Default::default()
        }
    }

    #[test]
    fn wildcard_matching_is_asymmetric() {
        let list = MxItem::new("", "pods", "list");
        let any = MxItem::new("", "pods", "*");

        assert!(list.matches(&any), "a concrete verb matches a wildcard rule");
        assert!(!any.matches(&list), "a wildcard verb does not match a concrete rule");
        assert!(any.matches(&any), "a wildcard verb matches a wildcard rule");

        let all_resources = MxItem::new("", "*", "get");
        assert!(!all_resources.matches(&MxItem::new("", "pods", "get")));
        assert!(all_resources.matches(&MxItem::new("", "*", "get")));
        assert!(MxItem::new("apps", "pods", "get").matches(&MxItem::new("*", "pods", "get")));
        assert!(!MxItem::new("apps", "pods", "get").matches(&MxItem::new("", "pods", "get")));
    }

    #[test]
    fn expands_the_cartesian_product() {
        let review = Review::new([""], ["pods", "services"], ["get", "list", "watch"]);
        let matrix = Matrix::expand(&review);
        assert_eq!(matrix.items().len(), 6);
        assert!(matrix.items().iter().all(|i| !i.is_matched()));
        assert!(!matrix.is_satisfied());
    }

    #[test]
    fn empty_matrix_is_never_satisfied() {
        let mut matrix = Matrix::expand(&Review::new([""], ["pods"], Vec::<String>::new()));
        assert!(matrix.is_empty());
        matrix.apply(&mk_rule(&["*"], &["*"], &["*"]));
        assert!(!matrix.is_satisfied());
    }

    #[test]
    fn matches_accumulate_across_rules() {
        let mut matrix = Matrix::expand(&Review::new([""], ["pods"], ["get", "list"]));
        matrix.apply(&mk_rule(&[""], &["pods"], &["get"]));
        assert!(!matrix.is_satisfied());
        matrix.apply(&mk_rule(&[""], &["pods"], &["list"]));
        assert!(matrix.is_satisfied());
    }

    #[test]
    fn enumerated_verbs_do_not_grant_a_wildcard() {
        let mut matrix = Matrix::expand(&Review::new([""], ["pods"], ["*"]));
        matrix.apply(&mk_rule(
            &[""],
            &["pods"],
            &["get", "list", "watch", "create", "update", "patch", "delete"],
        ));
        assert!(!matrix.is_satisfied());
        matrix.apply(&mk_rule(&[""], &["pods"], &["*"]));
        assert!(matrix.is_satisfied());
    }

    #[test]
    fn rules_expand_over_their_own_groups() {
        let mut matrix = Matrix::expand(&Review::new(["apps"], ["deployments"], ["get"]));
        matrix.apply(&mk_rule(&[""], &["deployments"], &["get"]));
        assert!(!matrix.is_satisfied(), "core group rule must not grant apps");
        matrix.apply(&mk_rule(&["", "apps"], &["deployments"], &["get"]));
        assert!(matrix.is_satisfied());
    }

    #[test]
    fn named_rules_grant_only_their_names() {
        let mut rule = mk_rule(&[""], &["pods"], &["get"]);
        rule.resource_names = Some(vec!["web".to_string()]);

        let mut unnamed = Matrix::expand(&Review::new([""], ["pods"], ["get"]));
        unnamed.apply(&rule);
        assert!(!unnamed.is_satisfied());

        let mut other = Matrix::expand(&Review::new([""], ["pods"], ["get"]).named("db"));
        other.apply(&rule);
        assert!(!other.is_satisfied());

        let mut web = Matrix::expand(&Review::new([""], ["pods"], ["get"]).named("web"));
        web.apply(&rule);
        assert!(web.is_satisfied());

        rule.resource_names = Some(Vec::new());
        unnamed.apply(&rule);
        assert!(unnamed.is_satisfied(), "an empty name list is unrestricted");
    }

    #[test]
    fn attributes_split_subresources() {
        let attrs = Review::new([""], ["pods/log"], ["get"])
            .in_namespace("ns")
            .named("web")
            .attributes();
        assert_eq!(
            attrs,
            vec![ResourceAttributes {
                group: Some("".to_string()),
                resource: Some("pods".to_string()),
                subresource: Some("log".to_string()),
                verb: Some("get".to_string()),
                namespace: Some("ns".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            }]
        );
    }
}
