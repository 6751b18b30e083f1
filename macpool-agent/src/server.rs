use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use kube::core::{admission::AdmissionReview, DynamicObject};
use log::info;
use warp::{http::StatusCode, reply::Reply, Filter, Rejection};

use crate::{leadership::LeadershipGate, webhook::dispatcher::Dispatcher};

pub const MUTATE_PODS_PATH: &str = "mutate-pods";
pub const MUTATE_VIRTUAL_MACHINES_PATH: &str = "mutate-virtualmachines";

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Ready once the allocation table is rebuilt while this replica leads.
#[derive(Clone)]
pub struct Readiness {
    rebuilt: Arc<AtomicBool>,
    gate: LeadershipGate,
}

impl Readiness {
    pub fn new(gate: LeadershipGate) -> Self {
        Self {
            rebuilt: Arc::new(AtomicBool::new(false)),
            gate,
        }
    }

    pub fn set_ready(&self) {
        self.rebuilt.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.rebuilt.load(Ordering::SeqCst) && self.gate.is_leader()
    }
}

pub fn health_routes(
    readiness: Readiness,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(move || match readiness.is_ready() {
            true => warp::reply::with_status("ok", StatusCode::OK),
            false => warp::reply::with_status("not ready", StatusCode::SERVICE_UNAVAILABLE),
        });

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", StatusCode::OK));

    readyz.or(healthz)
}

pub fn webhook_routes(
    dispatcher: Arc<Dispatcher>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let dispatcher = warp::any().map(move || dispatcher.clone());

    warp::post()
        .and(
            warp::path(MUTATE_PODS_PATH)
                .or(warp::path(MUTATE_VIRTUAL_MACHINES_PATH))
                .unify(),
        )
        .and(warp::path::end())
        .and(warp::body::json())
        .and(dispatcher)
        .and_then(
            |review: AdmissionReview<DynamicObject>, dispatcher: Arc<Dispatcher>| async move {
                Ok::<_, Infallible>(warp::reply::json(&dispatcher.review(review).await))
            },
        )
}

pub async fn serve_health(address: SocketAddr, readiness: Readiness) {
    info!("Serving health probes on {address}...");

    warp::serve(health_routes(readiness)).run(address).await
}

pub async fn serve_webhook(address: SocketAddr, tls: Option<TlsConfig>, dispatcher: Arc<Dispatcher>) {
    let routes = webhook_routes(dispatcher);

    match tls {
        Some(tls) => {
            info!("Serving admission webhook on {address} (TLS)...");
            warp::serve(routes)
                .tls()
                .cert_path(tls.cert_path)
                .key_path(tls.key_path)
                .run(address)
                .await
        }
        None => {
            info!("Serving admission webhook on {address}...");
            warp::serve(routes).run(address).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kube::core::{admission::AdmissionReview, DynamicObject};
    use serde_json::json;
    use warp::http::StatusCode;

    use crate::{
        leadership::LeadershipGate,
        watchers::WatchSync,
        webhook::{dispatcher::Dispatcher, namespaces::NamespaceFilter, tests::pool},
    };

    use super::{health_routes, webhook_routes, Readiness};

    #[tokio::test]
    async fn readiness_requires_rebuild_and_leadership() {
        let gate = LeadershipGate::new();
        let readiness = Readiness::new(gate.clone());
        let routes = health_routes(readiness.clone());

        let status = |routes| async move {
            warp::test::request()
                .method("GET")
                .path("/readyz")
                .reply(&routes)
                .await
                .status()
        };

        assert_eq!(status(routes.clone()).await, StatusCode::SERVICE_UNAVAILABLE);

        gate.promote();
        assert_eq!(status(routes.clone()).await, StatusCode::SERVICE_UNAVAILABLE);

        readiness.set_ready();
        assert_eq!(status(routes.clone()).await, StatusCode::OK);

        gate.demote();
        assert_eq!(status(routes).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let routes = health_routes(Readiness::new(LeadershipGate::new()));
        let response = warp::test::request().method("GET").path("/healthz").reply(&routes).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mutate_endpoint_answers_with_admission_review() {
        let gate = LeadershipGate::standalone();
        let pool = Arc::new(pool(&gate, "02:00:00:00:00:00", "02:00:00:00:00:0f"));
        let routes = webhook_routes(Arc::new(Dispatcher::new(
            pool,
            NamespaceFilter::disabled(),
            WatchSync::default(),
        )));

        let response = warp::test::request()
            .method("POST")
            .path("/mutate-pods")
            .json(&json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "request": {
                    "uid": "uid-1",
                    "kind": { "group": "", "version": "v1", "kind": "Pod" },
                    "resource": { "group": "", "version": "v1", "resource": "pods" },
                    "namespace": "default",
                    "operation": "CREATE",
                    "userInfo": {},
                    "object": {
                        "apiVersion": "v1",
                        "kind": "Pod",
                        "metadata": {
                            "name": "web",
                            "namespace": "default",
                            "annotations": { "k8s.v1.cni.cncf.io/networks": "br1" }
                        }
                    }
                }
            }))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);

        let review: AdmissionReview<DynamicObject> = serde_json::from_slice(response.body()).unwrap();
        let response = review.response.unwrap();

        assert_eq!(response.uid, "uid-1");
        assert!(response.allowed);
        assert!(response.patch.is_some());
    }
}
