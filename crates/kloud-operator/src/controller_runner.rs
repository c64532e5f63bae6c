//! Controller runner - builds one controller future per kind
//!
//! Every controller gets its dependencies through its constructor here; each
//! `build_*` function returns a boxed future the caller joins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use kloud_common::apply::Applier;
use kloud_common::crd::{App, Database, ManagedResource, ManagedService, Project, Router};
use kloud_common::job_tracker::KubeJobClient;
use kloud_common::kind_registry::KindRegistry;
use kloud_common::notifier::StatusNotifier;
use kloud_common::telemetry::controller_span;
use kloud_common::{APP_NAME_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use kloud_controllers::app::KubePodClient;
use kloud_controllers::database::MongoClientConnector;
use kloud_controllers::engine::{self, KubeObjectStore, ObjectStore};
use kloud_controllers::managed_resource::service_referrers;
use kloud_controllers::project::KubeNamespaceClient;
use kloud_controllers::secrets::KubeSecretClient;
use kloud_controllers::{
    AppReconciler, Context, DatabaseReconciler, ManagedResourceReconciler,
    ManagedServiceReconciler, ProjectReconciler, Reconciler, RouterReconciler,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Dependencies shared by every controller
#[derive(Clone)]
pub struct Shared {
    /// Kubernetes client
    pub client: Client,
    /// Child kind schemas
    pub registry: Arc<KindRegistry>,
    /// Dynamic apply layer
    pub applier: Arc<dyn Applier>,
    /// Status publisher
    pub notifier: Arc<dyn StatusNotifier>,
    /// Not-ready requeue delay
    pub retry_after: Duration,
    /// Reconciles running at once per controller
    pub concurrency: u16,
}

impl Shared {
    fn context<R: Reconciler>(
        &self,
        reconciler: R,
        store: Arc<dyn ObjectStore<R::Resource>>,
    ) -> Arc<Context<R>> {
        Arc::new(
            Context::new(reconciler, store, self.notifier.clone(), controller_span(R::NAME))
                .with_retry_after(self.retry_after),
        )
    }
}

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn managed_children() -> WatcherConfig {
    watcher().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"))
}

fn run<R: Reconciler>(
    controller: Controller<R::Resource>,
    ctx: Arc<Context<R>>,
    concurrency: u16,
) -> ControllerFuture {
    tracing::info!("- {} controller", R::NAME);
    Box::pin(
        controller
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(engine::reconcile::<R>, engine::error_policy::<R>, ctx)
            .for_each(log_reconcile_result(R::NAME)),
    )
}

/// Project controller, re-triggered by its namespace
pub fn build_project_controller(shared: &Shared) -> ControllerFuture {
    let client = shared.client.clone();
    let reconciler = ProjectReconciler::new(Arc::new(KubeNamespaceClient::new(client.clone())));
    let ctx = shared.context(reconciler, Arc::new(KubeObjectStore::<Project>::cluster(client.clone())));
    let graph = Arc::new(ProjectReconciler::watch_graph());

    let controller = Controller::new(Api::<Project>::all(client.clone()), watcher()).watches(
        Api::<Namespace>::all(client),
        managed_children(),
        graph.mapper::<Namespace>(),
    );
    run(controller, ctx, shared.concurrency)
}

/// App controller, re-triggered by its Deployment, pre-deploy Job and pods
pub fn build_app_controller(shared: &Shared) -> ControllerFuture {
    let client = shared.client.clone();
    let reconciler = AppReconciler::new(
        shared.applier.clone(),
        Arc::new(KubeJobClient::new(client.clone())),
        Arc::new(KubePodClient::new(client.clone())),
        shared.registry.clone(),
    );
    let ctx = shared.context(reconciler, Arc::new(KubeObjectStore::<App>::namespaced(client.clone())));
    let graph = Arc::new(AppReconciler::watch_graph());

    let controller = Controller::new(Api::<App>::all(client.clone()), watcher())
        .watches(
            Api::<Deployment>::all(client.clone()),
            managed_children(),
            graph.mapper::<Deployment>(),
        )
        .watches(Api::<Job>::all(client.clone()), managed_children(), graph.mapper::<Job>())
        .watches(
            Api::<Pod>::all(client),
            watcher().labels(APP_NAME_LABEL),
            graph.mapper::<Pod>(),
        );
    run(controller, ctx, shared.concurrency)
}

/// Router controller, re-triggered by its Ingress
pub fn build_router_controller(shared: &Shared) -> ControllerFuture {
    let client = shared.client.clone();
    let reconciler = RouterReconciler::new(shared.applier.clone());
    let ctx = shared.context(reconciler, Arc::new(KubeObjectStore::<Router>::namespaced(client.clone())));
    let graph = Arc::new(RouterReconciler::watch_graph());

    let controller = Controller::new(Api::<Router>::all(client.clone()), watcher()).watches(
        Api::<Ingress>::all(client),
        watcher(),
        graph.mapper::<Ingress>(),
    );
    run(controller, ctx, shared.concurrency)
}

/// ManagedService controller, re-triggered by typed backing stores and its secret
pub fn build_managed_service_controller(shared: &Shared) -> ControllerFuture {
    let client = shared.client.clone();
    let reconciler = ManagedServiceReconciler::new(
        shared.applier.clone(),
        Arc::new(KubeSecretClient::new(client.clone())),
        shared.registry.clone(),
    );
    let ctx = shared.context(
        reconciler,
        Arc::new(KubeObjectStore::<ManagedService>::namespaced(client.clone())),
    );
    let graph = Arc::new(ManagedServiceReconciler::watch_graph());

    let controller = Controller::new(Api::<ManagedService>::all(client.clone()), watcher())
        .watches(
            Api::<StatefulSet>::all(client.clone()),
            watcher(),
            graph.mapper::<StatefulSet>(),
        )
        .watches(
            Api::<Deployment>::all(client.clone()),
            watcher(),
            graph.mapper::<Deployment>(),
        )
        .watches(
            Api::<Secret>::all(client),
            managed_children(),
            graph.mapper::<Secret>(),
        );
    run(controller, ctx, shared.concurrency)
}

/// ManagedResource controller, re-triggered by typed children and the referenced ManagedService
pub fn build_managed_resource_controller(shared: &Shared) -> ControllerFuture {
    let client = shared.client.clone();
    let reconciler = ManagedResourceReconciler::new(shared.applier.clone(), shared.registry.clone());
    let ctx = shared.context(
        reconciler,
        Arc::new(KubeObjectStore::<ManagedResource>::namespaced(client.clone())),
    );
    let graph = Arc::new(ManagedResourceReconciler::watch_graph());

    let controller = Controller::new(Api::<ManagedResource>::all(client.clone()), watcher());
    let referrers = controller.store();
    let controller = controller
        .watches(
            Api::<Database>::all(client.clone()),
            managed_children(),
            graph.mapper::<Database>(),
        )
        .watches(
            Api::<ManagedService>::all(client),
            watcher(),
            move |msvc: ManagedService| service_referrers(msvc.meta(), &referrers.state()),
        );
    run(controller, ctx, shared.concurrency)
}

/// MongoDB Database controller, re-triggered by its credentials secret and its ManagedService
pub fn build_database_controller(shared: &Shared) -> ControllerFuture {
    let client = shared.client.clone();
    let reconciler = DatabaseReconciler::new(
        shared.applier.clone(),
        shared.registry.clone(),
        Arc::new(KubeSecretClient::new(client.clone())),
        Arc::new(MongoClientConnector::new()),
    );
    let ctx = shared.context(reconciler, Arc::new(KubeObjectStore::<Database>::namespaced(client.clone())));
    let graph = Arc::new(DatabaseReconciler::watch_graph());

    let controller = Controller::new(Api::<Database>::all(client.clone()), watcher());
    let referrers = controller.store();
    let controller = controller
        .watches(
            Api::<Secret>::all(client.clone()),
            managed_children(),
            graph.mapper::<Secret>(),
        )
        .watches(
            Api::<ManagedService>::all(client),
            watcher(),
            move |msvc: ManagedService| service_referrers(msvc.meta(), &referrers.state()),
        );
    run(controller, ctx, shared.concurrency)
}

/// Every controller the operator runs
pub fn build_all_controllers(shared: &Shared) -> Vec<ControllerFuture> {
    vec![
        build_project_controller(shared),
        build_app_controller(shared),
        build_router_controller(shared),
        build_managed_service_controller(shared),
        build_managed_resource_controller(shared),
        build_database_controller(shared),
    ]
}

/// Log each reconcile result of a controller stream
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
