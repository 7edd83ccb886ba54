#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
mod watch;

pub use self::{
    cluster::{ClientError, MigCluster, MigClusterSpec},
    watch::{Event, Watch},
};
pub use k8s_openapi::{
    api::{
        self,
        authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus, UserInfo},
        authorization::v1::{
            ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
        },
        core::v1::{
            Namespace, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod,
            Secret, Service,
        },
        rbac::v1::{
            ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
        },
    },
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, DynamicObject, ListParams, ObjectMeta, PostParams, Resource, ResourceExt},
    core::{ApiResource, ErrorResponse},
    runtime::watcher,
    Client, Config, Error,
};
