use crate::{
    resources::NAMESPACES,
    verbs::{GET, LIST},
    Authorizer, Result, Review, ReviewApi, ALL,
};
use ahash::AHashSet as HashSet;
use mig_discovery_k8s_api::{ResourceAttributes, SubjectAccessReviewSpec, TokenReviewStatus};
use std::collections::BTreeMap;

/// Authorizes requests with the cluster's own subject access reviews.
///
/// Reads of namespaces first consult the projects visible to the caller, listed once per
/// instance. When the cluster has no project API, a single review for reading all namespaces
/// stands in for the listing.
pub struct Delegated<R> {
    reviews: R,
    token: String,
    status: Option<TokenReviewStatus>,
    projects: Option<HashSet<String>>,
}

// === impl Delegated ===

impl<R: ReviewApi> Delegated<R> {
    pub fn new(reviews: R, token: impl Into<String>) -> Self {
        Self {
            reviews,
            token: token.into(),
            status: None,
            projects: None,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.user_info().and_then(|u| u.uid.as_deref())
    }

    pub fn extra(&self) -> BTreeMap<String, Vec<String>> {
        self.user_info()
            .and_then(|u| u.extra.clone())
            .unwrap_or_default()
    }

    fn user_info(&self) -> Option<&mig_discovery_k8s_api::UserInfo> {
        self.status
            .as_ref()
            .filter(|s| s.authenticated == Some(true))
            .and_then(|s| s.user.as_ref())
    }

    async fn authenticate(&mut self) -> Result<bool> {
        if self.status.is_none() {
            self.status = Some(self.reviews.token_review(&self.token).await?);
        }
        Ok(self.authenticated())
    }

    async fn allow_item(&mut self, attrs: ResourceAttributes) -> Result<bool> {
        let reads_namespaces = attrs.resource.as_deref() == Some(NAMESPACES)
            && matches!(attrs.verb.as_deref(), Some(LIST | GET));
        if reads_namespaces {
            let name = attrs.name.as_deref().unwrap_or_default();
            if self.allow_project(name).await? {
                return Ok(true);
            }
        }
        self.access_review(attrs).await
    }

    async fn allow_project(&mut self, name: &str) -> Result<bool> {
        let allowed =
            |projects: &HashSet<String>| projects.contains(ALL) || projects.contains(name);
        if let Some(projects) = &self.projects {
            return Ok(allowed(projects));
        }

        let projects = match self.reviews.list_projects(&self.token).await? {
            Some(names) => names.into_iter().collect::<HashSet<_>>(),
            None => {
                let all = ResourceAttributes {
                    resource: Some(NAMESPACES.to_string()),
                    verb: Some(GET.to_string()),
                    name: Some(ALL.to_string()),
                    ..Default::default()
                };
                let mut projects = HashSet::new();
                if self.access_review(all).await? {
                    projects.insert(ALL.to_string());
                }
                projects
            }
        };
        tracing::debug!(user = ?self.user(), projects = projects.len(), "Loaded projects");
        let ok = allowed(&projects);
        self.projects = Some(projects);
        Ok(ok)
    }

    async fn access_review(&self, attrs: ResourceAttributes) -> Result<bool> {
        let spec = SubjectAccessReviewSpec {
            resource_attributes: Some(attrs),
            user: self.user().map(Into::into),
            uid: self.uid().map(Into::into),
            groups: Some(self.groups().to_vec()),
            extra: Some(self.extra()),
            ..Default::default()
        };
        self.reviews.subject_access_review(spec).await
    }
}

#[async_trait::async_trait]
impl<R: ReviewApi> Authorizer for Delegated<R> {
    /// Every item of the expanded request must be allowed.
    async fn allow(&mut self, review: &Review) -> Result<bool> {
        if !self.authenticate().await? {
            return Ok(false);
        }
        let items = review.attributes();
        if items.is_empty() {
            return Ok(false);
        }
        for attrs in items {
            if !self.allow_item(attrs).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn authenticated(&self) -> bool {
        self.user_info().is_some()
    }

    fn user(&self) -> Option<&str> {
        self.user_info().and_then(|u| u.username.as_deref())
    }

    fn groups(&self) -> &[String] {
        self.user_info()
            .and_then(|u| u.groups.as_deref())
            .unwrap_or_default()
    }
}
