//! The activator: a single background thread that reconciles the local
//! registry against the cluster metadata.
//!
//! Each wakeup triggers one reconciliation pass: boot every tablespace
//! assigned to this node that is not hosted yet, then evict every hosted
//! tablespace that has reported failure. When the node is stopping, the
//! loop exits and tears down the collaborators in order.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossfire::Rx;
use tracing::{debug, error, info, warn};

use crate::error::NodeResult;
use crate::model::TableSpaceName;
use crate::node::NodeInner;
use crate::registry::ExclusiveRegistry;
use crate::tablespace::TableSpaceContext;

pub(crate) fn spawn(inner: Arc<NodeInner>, wakeups: Rx<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-activator", inner.config.node_id))
        .spawn(move || run(inner, wakeups))
}

fn run(inner: Arc<NodeInner>, wakeups: Rx<()>) {
    while !inner.is_stopped() {
        if wakeups.recv().is_err() {
            // Sender gone: the node is being dropped.
            break;
        }
        if inner.is_stopped() {
            break;
        }
        reconcile(&inner);
    }
    teardown(&inner);
    info!(node = %inner.config.node_id, "activator stopped");
}

/// One reconciliation pass. Boot runs under the exclusive lock so that a
/// manager only becomes reachable after its `start` has completed; the
/// failure scan runs without it.
fn reconcile(inner: &NodeInner) {
    {
        let mut registry = inner.registry.exclusive();
        match inner.metadata.list_table_spaces() {
            Ok(assigned) => {
                debug!(
                    node = %inner.config.node_id,
                    assigned = assigned.len(),
                    "reconciling tablespaces",
                );
                for name in assigned {
                    if registry.contains(&name) {
                        continue;
                    }
                    if let Err(err) = boot_table_space(inner, &mut registry, &name) {
                        warn!(
                            tablespace = %name,
                            error = %err,
                            "cannot boot tablespace, will retry on next wakeup",
                        );
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot list tablespaces from the metadata store");
            }
        }
    }

    let failed: Vec<TableSpaceName> = inner
        .registry
        .entries()
        .into_iter()
        .filter(|(_, manager)| manager.is_failed())
        .map(|(name, _)| name)
        .collect();
    if failed.is_empty() {
        return;
    }

    let mut registry = inner.registry.exclusive();
    for name in &failed {
        if let Some(manager) = registry.get(name) {
            if let Err(err) = manager.close() {
                error!(tablespace = %name, error = %err, "cannot close failed tablespace");
            }
        }
        registry.remove(name);
        warn!(tablespace = %name, "failed tablespace evicted");
    }
}

fn boot_table_space(
    inner: &NodeInner,
    registry: &mut ExclusiveRegistry<'_>,
    name: &TableSpaceName,
) -> NodeResult<()> {
    let descriptor = inner.metadata.describe(name)?;
    if !descriptor.replicas.contains(&inner.config.node_id) {
        debug!(tablespace = %name, "tablespace not assigned to this node");
        return Ok(());
    }

    info!(tablespace = %name, node = %inner.config.node_id, "booting tablespace");
    let log = inner.logs.create_log(name)?;
    let manager = inner.factory.create(TableSpaceContext {
        node_id: inner.config.node_id.clone(),
        descriptor,
        log,
        pages: inner.pages.clone(),
        metadata: inner.metadata.clone(),
        node: inner.handle(),
    })?;

    if let Err(err) = manager.start() {
        // Discard the partially constructed manager, closing its log.
        if let Err(close_err) = manager.close() {
            error!(
                tablespace = %name,
                error = %close_err,
                "cannot discard partially booted tablespace",
            );
        }
        return Err(err);
    }
    registry.insert(name.clone(), manager);
    Ok(())
}

/// Shutdown path: close every manager, then the page store, then the
/// metadata store. Each close is attempted exactly once; failures are
/// logged and never abort the remaining steps.
fn teardown(inner: &NodeInner) {
    {
        let mut registry = inner.registry.exclusive();
        for (name, manager) in registry.drain() {
            if let Err(err) = manager.close() {
                error!(
                    tablespace = %name,
                    error = %err,
                    "error closing tablespace during shutdown",
                );
            }
        }
    }
    if let Err(err) = inner.pages.close() {
        error!(error = %err, "error closing page store during shutdown");
    }
    if let Err(err) = inner.metadata.close() {
        error!(error = %err, "error closing metadata store during shutdown");
    }
}
