use std::collections::BTreeMap;

use futures_util::future::join_all;

use super::{algs, Error, ExecutorContext};
use crate::azure::CloudResource;
use crate::types::policy::AzureResourceFilter;

#[derive(Clone, Copy)]
enum Action {
    Stop,
    Start,
}

/// Stops cloud resources bucket by bucket, ascending priority. Operations
/// are fire-and-forget on shutdown.
pub(super) async fn shutdown(
    ctx: &ExecutorContext,
    filters: &[AzureResourceFilter],
) -> Result<(), Error> {
    if filters.is_empty() {
        return Ok(());
    }
    let buckets = fetch_resources(ctx, filters).await?;
    tracing::debug!("shutdown cloud resources");

    let mut errors = Vec::new();
    for (priority, resources) in buckets.iter() {
        run_bucket(ctx, *priority, resources, Action::Stop, &mut errors).await;
    }
    Error::combine(errors)
}

/// Starts cloud resources bucket by bucket, descending priority, waiting for
/// every operation to report completion.
pub(super) async fn startup(
    ctx: &ExecutorContext,
    filters: &[AzureResourceFilter],
) -> Result<(), Error> {
    if filters.is_empty() {
        return Ok(());
    }
    let buckets = fetch_resources(ctx, filters).await?;
    tracing::debug!("startup cloud resources");

    let mut errors = Vec::new();
    for (priority, resources) in buckets.iter().rev() {
        run_bucket(ctx, *priority, resources, Action::Start, &mut errors).await;
    }
    Error::combine(errors)
}

async fn run_bucket(
    ctx: &ExecutorContext,
    priority: i64,
    resources: &[CloudResource],
    action: Action,
    errors: &mut Vec<Error>,
) {
    tracing::debug!(priority, count = resources.len(), "process cloud priority bucket");
    let results = join_all(resources.iter().map(|resource| async move {
        match action {
            Action::Stop => {
                tracing::debug!(%resource, "shutdown cloud resource");
                ctx.cloud.stop(resource, false).await
            }
            Action::Start => {
                tracing::debug!(%resource, "startup cloud resource");
                ctx.cloud.start(resource, true).await
            }
        }
    }))
    .await;
    errors.extend(results.into_iter().filter_map(Result::err).map(Error::from));
}

async fn fetch_resources(
    ctx: &ExecutorContext,
    filters: &[AzureResourceFilter],
) -> Result<BTreeMap<i64, Vec<CloudResource>>, Error> {
    let mut buckets = BTreeMap::new();
    for filter in filters {
        let listed = ctx
            .cloud
            .list(filter.kind.into(), &filter.resource_group_name)
            .await?;
        algs::merge_cloud_resources(&mut buckets, listed, filter)?;
    }
    Ok(buckets)
}
