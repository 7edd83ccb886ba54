use crate::{Authorizer, Matrix, Result, Review, ReviewApi, Settings};
use ahash::AHashSet as HashSet;
use mig_discovery_store::{
    model::{Role, RoleBinding, Subject},
    Db, Model, Table,
};
use std::sync::Arc;


const SERVICE_ACCOUNT_PREFIX: [&str; 2] = ["system", "serviceaccount"];
const CLUSTER_ROLE: &str = "ClusterRole";

/// Authorizes requests by matching them against the roles bound to the caller in the store.
pub struct MatrixRbac<R> {
    reviews: R,
    db: Db,
    cluster: String,
    settings: Arc<Settings>,
    token: String,
    loaded: Option<Loaded>,
}

/// The caller's identity and reachable roles, resolved once.
#[derive(Debug, Default)]
struct Loaded {
    authenticated: bool,
    user: String,
    groups: Vec<String>,
    bindings: Vec<(RoleBinding, Role)>,
}

// === impl MatrixRbac ===

impl<R: ReviewApi> MatrixRbac<R> {
    /// `cluster` is the primary key of the cluster whose bindings and roles are consulted.
    pub fn new(
        reviews: R,
        db: Db,
        cluster: impl Into<String>,
        settings: Arc<Settings>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            reviews,
            db,
            cluster: cluster.into(),
            settings,
            token: token.into(),
            loaded: None,
        }
    }

    async fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Ok(());
        }

        let status = self.reviews.token_review(&self.token).await?;
        let mut loaded = Loaded::default();
        if status.authenticated == Some(true) {
            let user = status.user.unwrap_or_default();
            loaded.authenticated = true;
            loaded.user = user.username.unwrap_or_default();
            loaded.groups = user.groups.unwrap_or_default();

            let mut subjects = vec![subject_of(&loaded.user)];
            subjects.extend(loaded.groups.iter().map(Subject::group));
            let cluster = self.cluster.as_str();
            loaded.bindings = self.db.read(|table| bindings(table, cluster, &subjects))?;
            tracing::debug!(
                cluster,
                user = %loaded.user,
                bindings = loaded.bindings.len(),
                "Loaded role bindings",
            );
        }
        self.loaded = Some(loaded);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: ReviewApi> Authorizer for MatrixRbac<R> {
    async fn allow(&mut self, review: &Review) -> Result<bool> {
        if self.token.is_empty() {
            return Ok(self.settings.auth_optional);
        }
        self.load().await?;
        let loaded = match &self.loaded {
            Some(loaded) if loaded.authenticated => loaded,
            _ => return Ok(false),
        };
        if self.settings.allowed_users.contains(&loaded.user) {
            return Ok(true);
        }

        let mut matrix = Matrix::expand(review);
        if matrix.is_empty() {
            return Ok(false);
        }
        let namespace = review.namespace.as_deref().unwrap_or_default();
        for (binding, role) in &loaded.bindings {
            let ns = binding.base.namespace.as_str();
            if !ns.is_empty() && ns != namespace {
                continue;
            }
            for rule in role.decode_rules()? {
                matrix.apply(&rule);
                if matrix.is_satisfied() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn authenticated(&self) -> bool {
        self.loaded.as_ref().is_some_and(|l| l.authenticated)
    }

    fn user(&self) -> Option<&str> {
        self.loaded
            .as_ref()
            .filter(|l| l.authenticated)
            .map(|l| l.user.as_str())
    }

    fn groups(&self) -> &[String] {
        match &self.loaded {
            Some(loaded) => &loaded.groups,
            None => &[],
        }
    }
}

/// The subject for a user name. `system:serviceaccount:<namespace>:<name>` names a service account.
fn subject_of(user: &str) -> Subject {
    let parts = user.split(':').collect::<Vec<_>>();
    match parts.as_slice() {
        [a, b, namespace, name] if [*a, *b] == SERVICE_ACCOUNT_PREFIX => {
            Subject::service_account(*namespace, *name)
        }
        _ => Subject::user(user),
    }
}

/// Every binding granting a role to any of `subjects`, paired with the role it references.
///
/// Bindings whose role is not mirrored are skipped.
fn bindings(
    table: &Table<'_>,
    cluster: &str,
    subjects: &[Subject],
) -> mig_discovery_store::Result<Vec<(RoleBinding, Role)>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for subject in subjects {
        for binding in RoleBinding::list_by_subject(table, cluster, subject)? {
            if !seen.insert(binding.pk()) {
                continue;
            }
            match role_for(table, &binding)? {
                Some(role) => out.push((binding, role)),
                None => tracing::trace!(
                    namespace = %binding.base.namespace,
                    name = %binding.base.name,
                    "Bound role not found",
                ),
            }
        }
    }
    Ok(out)
}

/// Resolves a binding's role.
///
/// A `ClusterRole` reference, or any reference from a cluster-scoped binding, is looked up at
/// cluster scope. Other references are looked up in the binding's namespace first.
fn role_for(table: &Table<'_>, binding: &RoleBinding) -> mig_discovery_store::Result<Option<Role>> {
    let role_ref = binding.decode_role()?;
    let base = &binding.base;
    let cluster_role = Role::key(&base.cluster, "", &role_ref.name);
    let found = if role_ref.kind == CLUSTER_ROLE || base.namespace.is_empty() {
        table.get(&cluster_role)
    } else {
        match table.get(&Role::key(&base.cluster, &base.namespace, &role_ref.name)) {
            Err(error) if error.is_not_found() => table.get(&cluster_role),
            found => found,
        }
    };
    match found {
        Ok(role) => Ok(Some(role)),
        Err(error) if error.is_not_found() => Ok(None),
        Err(error) => Err(error),
    }
}
