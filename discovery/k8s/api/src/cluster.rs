use crate::{Api, Client, Config, ObjectReference, Secret};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    CustomResource,
};
use serde::{Deserialize, Serialize};

/// The secret entry holding a remote cluster's service account token.
pub const SA_TOKEN: &str = "saToken";

const REMOTE: &str = "remote";

/// A cluster taking part in a migration.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "MigCluster",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MigClusterSpec {
    /// The cluster hosting this controller. Reached with the process's own credentials.
    #[serde(default)]
    pub is_host_cluster: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// References the secret holding the service account token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_secret_ref: Option<ObjectReference>,

    /// Base64-encoded PEM CA bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// Skip TLS verification.
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cluster has no url")]
    MissingUrl,

    #[error("cluster has no service account secret reference")]
    MissingSecretRef,

    #[error("secret {namespace}/{name} not found")]
    MissingSecret { namespace: String, name: String },

    #[error("secret {namespace}/{name} has no `saToken` entry")]
    MissingToken { namespace: String, name: String },

    #[error("service account token is not valid UTF-8")]
    InvalidToken(#[from] std::string::FromUtf8Error),

    #[error("failed to build kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to infer local credentials: {0}")]
    Infer(#[from] kube::config::InferConfigError),

    #[error("failed to encode kubeconfig: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

// === impl MigCluster ===

impl MigCluster {
    /// A cluster is valid when it is the host or has a secret carrying a token.
    pub async fn is_valid(&self, host: &Client) -> bool {
        if self.spec.is_host_cluster {
            return true;
        }
        match self.service_account_token(host).await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(%error, "Cluster not valid");
                false
            }
        }
    }

    /// True when the fields used to connect to the cluster differ.
    pub fn connection_changed(&self, other: &MigCluster) -> bool {
        self.spec.url != other.spec.url
            || self.spec.service_account_secret_ref != other.spec.service_account_secret_ref
            || self.spec.ca_bundle != other.spec.ca_bundle
            || self.spec.insecure != other.spec.insecure
            || self.spec.is_host_cluster != other.spec.is_host_cluster
    }

    /// Reads the service account token from the referenced secret.
    pub async fn service_account_token(&self, host: &Client) -> Result<String, ClientError> {
        let secret_ref = self
            .spec
            .service_account_secret_ref
            .as_ref()
            .ok_or(ClientError::MissingSecretRef)?;
        let namespace = secret_ref
            .namespace
            .clone()
            .or_else(|| kube::ResourceExt::namespace(self))
            .unwrap_or_default();
        let name = secret_ref.name.clone().unwrap_or_default();

        let secret = Api::<Secret>::namespaced(host.clone(), &namespace)
            .get_opt(&name)
            .await?
            .ok_or_else(|| ClientError::MissingSecret {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
        let token = secret
            .data
            .and_then(|mut data| data.remove(SA_TOKEN))
            .ok_or(ClientError::MissingToken { namespace, name })?;
        Ok(String::from_utf8(token.0)?)
    }

    /// Builds the client configuration for the cluster.
    ///
    /// The host cluster uses the process's own credentials. Remote clusters are reached with the
    /// service account token referenced by the spec.
    pub async fn rest_config(&self, host: &Client) -> Result<Config, ClientError> {
        if self.spec.is_host_cluster {
            return Ok(Config::infer().await?);
        }
        let token = self.service_account_token(host).await?;
        self.remote_config(&token).await
    }

    /// Builds the configuration used to act as the holder of `token`.
    pub async fn subject_config(&self, token: &str) -> Result<Config, ClientError> {
        if self.spec.is_host_cluster {
            let config = Config::infer().await?;
            return Ok(with_bearer_token(config, token));
        }
        self.remote_config(token).await
    }

    async fn remote_config(&self, token: &str) -> Result<Config, ClientError> {
        let server = self.spec.url.clone().ok_or(ClientError::MissingUrl)?;
        let mut cluster = serde_json::json!({
            "server": server,
            "insecure-skip-tls-verify": self.spec.insecure,
        });
        if let Some(ca) = self.spec.ca_bundle.as_ref().filter(|ca| !ca.is_empty()) {
            cluster["certificate-authority-data"] = ca.clone().into();
        }
        let kubeconfig = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": REMOTE, "cluster": cluster }],
            "users": [{ "name": REMOTE, "user": { "token": token } }],
            "contexts": [{ "name": REMOTE, "context": { "cluster": REMOTE, "user": REMOTE } }],
            "current-context": REMOTE,
        });
        let kubeconfig = Kubeconfig::from_yaml(&serde_json::to_string(&kubeconfig)?)?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        Ok(config)
    }
}

/// Replaces the configuration's credentials with a bearer token.
pub fn with_bearer_token(mut config: Config, token: &str) -> Config {
    config.auth_info.token = Some(token.to_string().into());
    config.auth_info.token_file = None;
    config.auth_info.client_certificate = None;
    config.auth_info.client_certificate_data = None;
    config.auth_info.client_key = None;
    config.auth_info.client_key_data = None;
    config
}
