use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    time::Duration,
};

use backoff::ExponentialBackoff;

use k8s_openapi::serde::de::DeserializeOwned;
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Resource,
};
use log::{info, warn};
use serde_json::json;

use crate::helpers::pretty_type_name;

const LIST_PAGE_SIZE: u32 = 500;

/// Lists every matching resource, following continue tokens page by page.
pub async fn list_resources<T>(api: &Api<T>, params: &ListParams) -> Result<Vec<T>, kube::Error>
where
    T: Resource + Clone + DeserializeOwned + Debug,
{
    let mut params = params.clone();
    let mut resources = Vec::new();

    if params.limit.is_none() {
        params.limit = Some(LIST_PAGE_SIZE);
    }

    loop {
        let page = api.list(&params).await?;

        resources.extend(page.items);

        match page.metadata.continue_ {
            Some(token) if !token.is_empty() => params.continue_token = Some(token),
            _ => break,
        }
    }

    info!(
        "Listed {} {} resource(s) from the cluster.",
        resources.len(),
        pretty_type_name::<T>()
    );

    Ok(resources)
}

pub async fn patch_resource_labels<T>(
    api: &Api<T>,
    name: &str,
    labels: &BTreeMap<String, String>,
    patch_params: &PatchParams,
) -> Result<(), kube::Error>
where
    T: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = json!({
        "metadata": {
            "labels": labels
        }
    });

    api.patch(name, patch_params, &Patch::Merge(patch)).await?;

    Ok(())
}

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Exponential policy for calls to the cluster that must eventually succeed,
/// it never gives up on its own.
pub fn cluster_retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: RETRY_INITIAL_INTERVAL,
        initial_interval: RETRY_INITIAL_INTERVAL,
        multiplier: 2.0,
        max_interval: RETRY_MAX_INTERVAL,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Retry notification logging the failed attempt.
pub fn log_retry<E: Display>(description: &str) -> impl FnMut(E, Duration) + '_ {
    move |error, delay| warn!("{description} failed, retrying in {delay:?}! {error}")
}
