//! Secret access shared by the service controllers

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use kloud_common::apply::{create_or_update, Applied};
use kloud_common::crd::ManagedObject;
use kloud_common::watch_graph::owner_reference;
use kloud_common::{Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Secret reads and writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Get a secret, `None` if missing
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create the secret or replace its data, labels and owners
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// [`SecretClient`] backed by the Kubernetes API
pub struct KubeSecretClient {
    client: Client,
}

impl KubeSecretClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let (_, applied) = create_or_update(&api, &name, |live: &mut Secret| {
            live.metadata.namespace = secret.metadata.namespace.clone();
            live.labels_mut()
                .extend(secret.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
            live.metadata.owner_references = secret.metadata.owner_references.clone();
            live.data = secret.data.clone();
        })
        .await?;
        if applied != Applied::Unchanged {
            info!(secret = %name, namespace = %namespace, ?applied, "Wrote secret");
        }
        Ok(())
    }
}

/// A UTF-8 value of `key`, from `data` or `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .or_else(|| secret.string_data.as_ref()?.get(key).cloned())
}

/// An opaque secret owned by `owner`
pub fn owned_secret<K: ManagedObject>(
    owner: &K,
    name: String,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, ByteString>,
) -> Result<Secret, Error> {
    let reference = owner_reference(owner)
        .ok_or_else(|| Error::internal_with_context("secret", "owner has no uid yet"))?;
    let mut labels = labels;
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: owner.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![reference]),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Secret data from string pairs
pub fn string_data<'a>(
    pairs: impl IntoIterator<Item = (&'a str, String)>,
) -> BTreeMap<String, ByteString> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.into_bytes())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kloud_common::crd::{Database, DatabaseSpec};

    #[test]
    fn values_are_read_from_data_then_string_data() {
        let secret = Secret {
            data: Some(string_data([("URI", "mongodb://mongo:27017".to_string())])),
            string_data: Some(BTreeMap::from([("HOSTS".to_string(), "mongo:27017".to_string())])),
            ..Default::default()
        };
        assert_eq!(secret_value(&secret, "URI").unwrap(), "mongodb://mongo:27017");
        assert_eq!(secret_value(&secret, "HOSTS").unwrap(), "mongo:27017");
        assert!(secret_value(&secret, "PASSWORD").is_none());
    }

    #[test]
    fn owned_secrets_live_next_to_their_owner() {
        let mut db = Database::new("orders", DatabaseSpec::default());
        db.metadata.namespace = Some("acme".into());
        db.metadata.uid = Some("uid-1".into());

        let secret = owned_secret(
            &db,
            "mres-orders".into(),
            BTreeMap::new(),
            string_data([("USERNAME", "orders".to_string())]),
        )
        .unwrap();
        assert_eq!(secret.namespace().as_deref(), Some("acme"));
        assert_eq!(secret.owner_references()[0].kind, "Database");
        assert_eq!(secret.labels()[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
    }
}
