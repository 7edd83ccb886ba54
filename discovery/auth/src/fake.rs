use crate::{Result, ReviewApi};
use ahash::AHashMap as HashMap;
use mig_discovery_k8s_api::{
    ResourceAttributes, SubjectAccessReviewSpec, TokenReviewStatus, UserInfo,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// An in-process review API.
///
/// Tokens registered with [`FakeReviews::with_user`] authenticate; all others do not. Access
/// reviews are allowed when their attributes were registered with [`FakeReviews::allow`].
#[derive(Clone, Default)]
pub(crate) struct FakeReviews(Arc<Mutex<State>>);

#[derive(Default)]
struct State {
    users: HashMap<String, UserInfo>,
    allowed: Vec<ResourceAttributes>,
    projects: Option<Vec<String>>,
    calls: Vec<String>,
}

impl FakeReviews {
    pub fn with_user(self, token: &str, username: &str, groups: &[&str]) -> Self {
        let user = UserInfo {
            username: Some(username.to_string()),
            uid: Some(format!("uid-{username}")),
            groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            extra: Some(maplit::btreemap! {
                "scopes.authorization.openshift.io".to_string() => vec!["user:full".to_string()],
            }),
        };
        self.0.lock().users.insert(token.to_string(), user);
        self
    }

    pub fn with_projects(self, projects: &[&str]) -> Self {
        self.0.lock().projects = Some(projects.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn allow(&self, attributes: impl IntoIterator<Item = ResourceAttributes>) {
        self.0.lock().allowed.extend(attributes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().calls.clone()
    }
}

#[async_trait::async_trait]
impl ReviewApi for FakeReviews {
    async fn token_review(&self, token: &str) -> Result<TokenReviewStatus> {
        let mut state = self.0.lock();
        state.calls.push("token_review".to_string());
        Ok(match state.users.get(token) {
            Some(user) => TokenReviewStatus {
                authenticated: Some(true),
                user: Some(user.clone()),
                ..Default::default()
            },
            None => TokenReviewStatus {
                authenticated: Some(false),
                ..Default::default()
            },
        })
    }

    async fn subject_access_review(&self, spec: SubjectAccessReviewSpec) -> Result<bool> {
        let mut state = self.0.lock();
        let attrs = spec.resource_attributes.unwrap_or_default();
        state.calls.push(format!(
            "sar {} {} {}",
            attrs.verb.as_deref().unwrap_or_default(),
            attrs.resource.as_deref().unwrap_or_default(),
            attrs.name.as_deref().unwrap_or_default(),
        ));
        let known = spec
            .user
            .as_ref()
            .is_some_and(|u| state.users.values().any(|i| i.username.as_ref() == Some(u)));
        Ok(known && state.allowed.contains(&attrs))
    }

    async fn list_projects(&self, _token: &str) -> Result<Option<Vec<String>>> {
        let mut state = self.0.lock();
        state.calls.push("list_projects".to_string());
        Ok(state.projects.clone())
    }
}
