use crate::{Result, TokenCache};
use mig_discovery_k8s_api::{
    Api, ApiResource, Client, DynamicObject, Error as KubeError, ListParams, MigCluster,
    PostParams, ResourceExt, SubjectAccessReview, SubjectAccessReviewSpec, TokenReview,
    TokenReviewSpec, TokenReviewStatus,
};
use std::sync::Arc;

/// The remote calls made while authorizing a request.
#[async_trait::async_trait]
pub trait ReviewApi: Send + Sync + 'static {
    /// Authenticates a bearer token.
    async fn token_review(&self, token: &str) -> Result<TokenReviewStatus>;

    /// Asks the cluster whether the described subject may perform the described access.
    async fn subject_access_review(&self, spec: SubjectAccessReviewSpec) -> Result<bool>;

    /// Lists the names of the projects visible to the holder of `token`.
    ///
    /// `None` when the cluster has no project API or refuses the listing.
    async fn list_projects(&self, token: &str) -> Result<Option<Vec<String>>>;
}

/// Reviews against a live cluster.
#[derive(Clone)]
pub struct KubeReviews {
    client: Client,
    cluster: Arc<MigCluster>,
    key: String,
    cache: Arc<TokenCache>,
}

// === impl KubeReviews ===

impl KubeReviews {
    pub fn new(client: Client, cluster: MigCluster, cache: Arc<TokenCache>) -> Self {
        let key = format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        );
        Self {
            client,
            cluster: Arc::new(cluster),
            key,
            cache,
        }
    }

    fn projects() -> ApiResource {
        ApiResource {
            group: "project.openshift.io".to_string(),
            version: "v1".to_string(),
            api_version: "project.openshift.io/v1".to_string(),
            kind: "Project".to_string(),
            plural: "projects".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ReviewApi for KubeReviews {
    async fn token_review(&self, token: &str) -> Result<TokenReviewStatus> {
        if let Some(status) = self.cache.get(&self.key, token) {
            tracing::trace!(cluster = %self.key, "Token review cached");
            return Ok(status);
        }

        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let review = Api::<TokenReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        let status = review.status.unwrap_or_default();
        tracing::debug!(
            cluster = %self.key,
            authenticated = status.authenticated.unwrap_or(false),
            "Token reviewed",
        );
        self.cache.insert(&self.key, token, status.clone());
        Ok(status)
    }

    async fn subject_access_review(&self, spec: SubjectAccessReviewSpec) -> Result<bool> {
        let review = SubjectAccessReview {
            spec,
            ..Default::default()
        };
        let review = Api::<SubjectAccessReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        Ok(review.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn list_projects(&self, token: &str) -> Result<Option<Vec<String>>> {
        let config = self.cluster.subject_config(token).await?;
        let client = Client::try_from(config)?;
        let api = Api::<DynamicObject>::all_with(client, &Self::projects());
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(Some(list.items.iter().map(|p| p.name_any()).collect())),
            Err(KubeError::Api(rsp)) if matches!(rsp.code, 401 | 403 | 404) => {
                tracing::debug!(cluster = %self.key, code = rsp.code, "Projects not listed");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }
}
