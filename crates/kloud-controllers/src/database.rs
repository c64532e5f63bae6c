//! MongoDB Database controller
//!
//! Provisions a database user inside a MongoDB managed service and writes
//! its credentials to `mres-<name>`. Connection details come from the
//! service's published secret `msvc-<service>`. Users live in the `admin`
//! database with `dbOwner` on their own database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use mongodb::bson::{doc, Document};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use kloud_common::apply::Applier;
use kloud_common::condition::{self, Condition};
use kloud_common::crd::Database;
use kloud_common::kind_registry::KindRegistry;
use kloud_common::watch_graph::{any_child, ParentMapping, WatchGraph};
use kloud_common::{Error, MRES_NAME_LABEL};

use crate::engine::{ApplyOutcome, Observation, Reconciler};
use crate::managed_resource::{managed_service_dependency, MANAGED_SERVICE_READY};
use crate::managed_service::published_secret_name;
use crate::secrets::{owned_secret, secret_value, string_data, SecretClient};

/// Finalizer held by the database controller
pub const DATABASE_FINALIZER: &str = "finalizers.kloud.dev/mongodb-database";

/// Connection details of the service are available
pub const CONNECTION_READY: &str = "ConnectionReady";

/// The database user exists
pub const USER_CREATED: &str = "UserCreated";

/// The credentials secret exists
pub const SECRET_CREATED: &str = "SecretCreated";

const AUTH_DATABASE: &str = "admin";
const PASSWORD_LENGTH: usize = 32;

/// Secret holding the credentials of a provisioned database
pub fn credentials_secret_name(database: &str) -> String {
    format!("mres-{database}")
}

/// User administration commands run against the `admin` database
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MongoAdmin: Send + Sync {
    /// Number of users named `user` (`usersInfo`)
    async fn users_info(&self, user: &str) -> Result<usize, Error>;

    /// Create `user` as `dbOwner` of `database` (`createUser`)
    async fn create_user(&self, user: &str, password: &str, database: &str) -> Result<(), Error>;

    /// Reset the password of `user` (`updateUser`)
    async fn update_password(&self, user: &str, password: &str) -> Result<(), Error>;

    /// Drop `user` (`dropUser`)
    async fn drop_user(&self, user: &str) -> Result<(), Error>;
}

/// Opens admin sessions from a connection string
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MongoConnector: Send + Sync {
    /// Admin access to the deployment behind `uri`
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MongoAdmin>, Error>;
}

/// [`MongoConnector`] reusing one driver client per connection string
#[derive(Default)]
pub struct MongoClientConnector {
    clients: Mutex<HashMap<String, mongodb::Client>>,
}

impl MongoClientConnector {
    /// Create a connector with an empty client cache
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, uri: &str) -> Option<mongodb::Client> {
        self.clients.lock().ok()?.get(uri).cloned()
    }
}

#[async_trait]
impl MongoConnector for MongoClientConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn MongoAdmin>, Error> {
        let client = match self.cached(uri) {
            Some(client) => client,
            None => {
                let client = mongodb::Client::with_uri_str(uri)
                    .await
                    .map_err(|e| Error::database_for("connect", e.to_string()))?;
                if let Ok(mut clients) = self.clients.lock() {
                    clients.insert(uri.to_string(), client.clone());
                }
                client
            }
        };
        Ok(Arc::new(MongoUserAdmin {
            db: client.database(AUTH_DATABASE),
        }))
    }
}

struct MongoUserAdmin {
    db: mongodb::Database,
}

impl MongoUserAdmin {
    async fn command(&self, user: &str, command: Document) -> Result<Document, Error> {
        self.db
            .run_command(command)
            .await
            .map_err(|e| Error::database_for(user, e.to_string()))
    }
}

#[async_trait]
impl MongoAdmin for MongoUserAdmin {
    async fn users_info(&self, user: &str) -> Result<usize, Error> {
        let reply = self
            .command(user, doc! { "usersInfo": { "user": user, "db": AUTH_DATABASE } })
            .await?;
        Ok(reply.get_array("users").map(|users| users.len()).unwrap_or(0))
    }

    async fn create_user(&self, user: &str, password: &str, database: &str) -> Result<(), Error> {
        self.command(
            user,
            doc! {
                "createUser": user,
                "pwd": password,
                "roles": [{ "role": "dbOwner", "db": database }],
            },
        )
        .await?;
        Ok(())
    }

    async fn update_password(&self, user: &str, password: &str) -> Result<(), Error> {
        self.command(user, doc! { "updateUser": user, "pwd": password })
            .await?;
        Ok(())
    }

    async fn drop_user(&self, user: &str) -> Result<(), Error> {
        self.command(user, doc! { "dropUser": user }).await?;
        Ok(())
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Connection string handed to consumers of the database
pub fn connection_uri(user: &str, password: &str, hosts: &str, database: &str) -> String {
    format!("mongodb://{user}:{password}@{hosts}/{database}?authSource={AUTH_DATABASE}")
}

struct Connection {
    admin: Arc<dyn MongoAdmin>,
    hosts: String,
}

/// Reconciles MongoDB [`Database`]s
pub struct DatabaseReconciler {
    applier: Arc<dyn Applier>,
    registry: Arc<KindRegistry>,
    secrets: Arc<dyn SecretClient>,
    mongo: Arc<dyn MongoConnector>,
}

impl DatabaseReconciler {
    /// Create a reconciler
    pub fn new(
        applier: Arc<dyn Applier>,
        registry: Arc<KindRegistry>,
        secrets: Arc<dyn SecretClient>,
        mongo: Arc<dyn MongoConnector>,
    ) -> Self {
        Self {
            applier,
            registry,
            secrets,
            mongo,
        }
    }

    /// The credentials secret maps back through its owner
    pub fn watch_graph() -> WatchGraph<Database> {
        WatchGraph::namespaced().edge::<Secret>(ParentMapping::ControllerOwner, any_child)
    }

    /// Connect using the service's published secret
    ///
    /// `Err(condition)` explains why no connection is possible yet.
    async fn connect(&self, db: &Database) -> Result<Result<Connection, Condition>, Error> {
        let msvc = &db.spec.msvc_ref;
        let namespace = msvc
            .namespace_or(&db.namespace().unwrap_or_default())
            .to_string();
        let name = published_secret_name(&msvc.name);
        let Some(secret) = self.secrets.get_secret(&namespace, &name).await? else {
            return Ok(Err(Condition::failed(
                CONNECTION_READY,
                "SecretNotFound",
                format!("secret {namespace}/{name} does not exist"),
            )));
        };
        let (Some(uri), Some(hosts)) = (secret_value(&secret, "URI"), secret_value(&secret, "HOSTS"))
        else {
            return Ok(Err(Condition::failed(
                CONNECTION_READY,
                "MissingKey",
                format!("secret {namespace}/{name} needs URI and HOSTS"),
            )));
        };
        let admin = self.mongo.connect(&uri).await?;
        Ok(Ok(Connection { admin, hosts }))
    }

    async fn stored_password(&self, db: &Database) -> Result<Option<String>, Error> {
        let secret = self
            .secrets
            .get_secret(&db.namespace().unwrap_or_default(), &credentials_secret_name(&db.name_any()))
            .await?;
        Ok(secret.and_then(|s| secret_value(&s, "PASSWORD")))
    }
}

#[async_trait]
impl Reconciler for DatabaseReconciler {
    type Resource = Database;
    const NAME: &'static str = "mongodb-database";
    const FINALIZER: &'static str = DATABASE_FINALIZER;

    async fn dependencies(&self, db: &Database) -> Result<Vec<Condition>, Error> {
        let dependency = managed_service_dependency(
            self.applier.as_ref(),
            &self.registry,
            &db.spec.msvc_ref,
            &db.namespace().unwrap_or_default(),
        )
        .await?;
        Ok(vec![dependency])
    }

    async fn apply(&self, db: &Database) -> Result<ApplyOutcome, Error> {
        if db.spec.msvc_ref.name.is_empty() {
            return Err(Error::validation_for_field(
                db.name_any(),
                "spec.msvcRef.name",
                "a managed service is required",
            ));
        }
        let connection = match self.connect(db).await? {
            Ok(connection) => connection,
            Err(blocked) => return Ok(ApplyOutcome::Blocked(vec![blocked])),
        };

        let user = db.name_any();
        let database = db.database_name();
        let stored = self.stored_password(db).await?;
        let password = stored.clone().unwrap_or_else(generate_password);

        match connection.admin.users_info(&user).await? {
            0 => {
                connection.admin.create_user(&user, &password, &database).await?;
                info!(user = %user, database = %database, "Created database user");
            }
            _ if stored.is_none() => {
                connection.admin.update_password(&user, &password).await?;
                warn!(user = %user, "Credentials secret was missing, reset user password");
            }
            _ => {}
        }

        let secret = owned_secret(
            db,
            credentials_secret_name(&user),
            BTreeMap::from([(MRES_NAME_LABEL.to_string(), user.clone())]),
            string_data([
                ("USERNAME", user.clone()),
                ("PASSWORD", password.clone()),
                ("HOSTS", connection.hosts.clone()),
                ("DB_NAME", database.clone()),
                (
                    "URI",
                    connection_uri(&user, &password, &connection.hosts, &database),
                ),
            ]),
        )?;
        self.secrets.apply_secret(&secret).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn observe(&self, db: &Database) -> Result<Observation, Error> {
        let connection = match self.connect(db).await? {
            Ok(connection) => connection,
            Err(not_connected) => return Ok(Observation::conditions(vec![not_connected])),
        };
        let user = db.name_any();
        let user_created = match connection.admin.users_info(&user).await? {
            0 => Condition::failed(USER_CREATED, "NotFound", format!("user {user} does not exist")),
            _ => Condition::ok(USER_CREATED),
        };
        let secret_created = match self.stored_password(db).await? {
            Some(_) => Condition::ok(SECRET_CREATED),
            None => Condition::failed(
                SECRET_CREATED,
                "NotFound",
                format!("secret {} does not exist", credentials_secret_name(&user)),
            ),
        };
        Ok(Observation::conditions(vec![
            Condition::ok(CONNECTION_READY),
            user_created,
            secret_created,
        ]))
    }

    fn is_ready(&self, conditions: &[Condition]) -> bool {
        condition::all_true(
            conditions,
            &[MANAGED_SERVICE_READY, CONNECTION_READY, USER_CREATED, SECRET_CREATED],
        )
    }

    /// Drop the user, but only when exactly one account matches
    async fn cleanup(&self, db: &Database) -> Result<(), Error> {
        let user = db.name_any();
        let connection = match self.connect(db).await? {
            Ok(connection) => connection,
            Err(reason) => {
                warn!(user = %user, reason = %reason.message, "Service connection gone, nothing to drop");
                return Ok(());
            }
        };
        match connection.admin.users_info(&user).await? {
            1 => {
                connection.admin.drop_user(&user).await?;
                info!(user = %user, "Dropped database user");
            }
            matches => info!(user = %user, matches, "Skipping drop, user is not uniquely present"),
        }
        Ok(())
    }
}
