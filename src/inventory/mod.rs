//! Cluster Inventory Collector: walks each configured
//! cluster context and produces a complete `ImageUsage` snapshot.
//!
//! Grounded in `k8s-inventory.py`'s `load_from_kubernetes` /
//! `load_cronjobs_from_kubernetes`, and in `headwind::polling`'s
//! `Client::try_default` / `Api::all` idiom for talking to the cluster.

pub mod reference;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use self::reference::{canonical_container_image, digest_prefix_map};
use crate::error::{CoreError, CoreResult};
use crate::model::{ImageUsage, Occurrence, PhaseFlags, UsageRecord};

const DEFAULT_MAX_AGE_DAYS: f64 = 31.0;
const CONTEXT_CONCURRENCY: usize = 4;

/// Produces a complete `ImageUsage` snapshot from a specified set of
/// cluster contexts, or every context in the ambient kubeconfig when
/// none are specified.
pub struct InventoryCollector {
    contexts: Vec<String>,
    max_age_days: f64,
}

impl InventoryCollector {
    pub fn new(contexts: Vec<String>, max_age_days: Option<f64>) -> InventoryCollector {
        InventoryCollector {
            contexts,
            max_age_days: max_age_days.unwrap_or(DEFAULT_MAX_AGE_DAYS),
        }
    }

    #[instrument(skip(self, cancel))]
    pub async fn collect(&self, cancel: &CancellationToken) -> CoreResult<ImageUsage> {
        let contexts = self.resolve_contexts().await?;

        let max_age_days = self.max_age_days;
        let partials: Vec<CoreResult<ImageUsage>> = stream::iter(contexts)
            .map(|context| async move {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let client = client_for_context(&context).await?;
                collect_context(client, &context, max_age_days, cancel).await
            })
            .buffer_unordered(CONTEXT_CONCURRENCY)
            .collect()
            .await;

        let mut merged = ImageUsage::new();
        for partial in partials {
            merge_into(&mut merged, partial?);
        }
        Ok(merged)
    }

    /// Enumerate the contexts to walk: explicit `--context` flags take
    /// priority; otherwise every context in the ambient kubeconfig;
    /// falling back to a single synthetic `"in-cluster"` context when
    /// no kubeconfig is found, matching `k8s-inventory.py::main`'s
    /// fallback chain.
    async fn resolve_contexts(&self) -> CoreResult<Vec<String>> {
        if !self.contexts.is_empty() {
            return Ok(self.contexts.clone());
        }

        match Kubeconfig::read() {
            Ok(kubeconfig) => {
                let names: Vec<String> =
                    kubeconfig.contexts.iter().map(|c| c.name.clone()).collect();
                if names.is_empty() {
                    Ok(vec!["in-cluster".to_string()])
                } else {
                    info!(count = names.len(), "loaded contexts from kube-config file");
                    Ok(names)
                }
            },
            Err(_) => {
                info!("no kube-config file found, assuming in-cluster credentials");
                Ok(vec!["in-cluster".to_string()])
            },
        }
    }
}

async fn client_for_context(context: &str) -> CoreResult<Client> {
    if context == "in-cluster" {
        return Client::try_default().await.map_err(|source| CoreError::InventoryFatal {
            context: context.to_string(),
            reason: source.to_string(),
        });
    }

    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        cluster: None,
        user: None,
    };
    let config = Config::from_kubeconfig(&options)
        .await
        .map_err(|source| CoreError::InventoryFatal {
            context: context.to_string(),
            reason: source.to_string(),
        })?;
    Client::try_from(config).map_err(|source| CoreError::InventoryFatal {
        context: context.to_string(),
        reason: source.to_string(),
    })
}

#[instrument(skip(client))]
async fn collect_context(
    client: Client,
    context: &str,
    max_age_days: f64,
    cancel: &CancellationToken,
) -> CoreResult<ImageUsage> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let mut usage = ImageUsage::new();

    let pods: Api<Pod> = Api::all(client.clone());
    let pod_list = pods
        .list(&Default::default())
        .await
        .map_err(|source| CoreError::InventoryFatal {
            context: context.to_string(),
            reason: source.to_string(),
        })?;

    let mut pod_count = 0usize;
    for pod in &pod_list.items {
        if collect_pod(pod, context, max_age_days, &mut usage) {
            pod_count += 1;
        }
    }
    info!(context, pods = pod_count, "collected pod usage");

    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let cronjobs: Api<CronJob> = Api::all(client);
    match cronjobs.list(&Default::default()).await {
        Ok(list) => {
            let mut count = 0usize;
            for cronjob in &list.items {
                count += collect_cronjob(cronjob, &mut usage);
            }
            info!(context, cronjobs = count, "collected cronjob usage");
        },
        Err(kube::Error::Api(err)) if err.code == 404 => {
            info!(context, "no CronJobs found");
        },
        Err(source) => {
            return Err(CoreError::InventoryFatal {
                context: context.to_string(),
                reason: source.to_string(),
            });
        },
    }

    Ok(usage)
}

fn collect_pod(pod: &Pod, context: &str, max_age_days: f64, usage: &mut ImageUsage) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    let Some(container_statuses) = &status.container_statuses else {
        return false;
    };
    let Some(spec) = &pod.spec else {
        return false;
    };
    let Some(namespace) = &pod.metadata.namespace else {
        return false;
    };
    let Some(pod_name) = &pod.metadata.name else {
        return false;
    };

    let pod_images: Vec<String> = spec.containers.iter().filter_map(|c| c.image.clone()).collect();
    let image_by_digest = digest_prefix_map(&pod_images);

    let phase = status.phase.as_deref().unwrap_or("Unknown");
    let any_ipbo = container_statuses.iter().any(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            == Some("ImagePullBackOff")
    });

    let pod_age_days = if matches!(phase, "Pending" | "Running") || any_ipbo {
        0.0
    } else {
        status
            .start_time
            .as_ref()
            .map(|t| (Utc::now() - t.0).num_seconds() as f64 / 86400.0)
            .unwrap_or(0.0)
            .max(0.0)
    };

    let mut touched = false;
    for cs in container_statuses {
        let status_image = cs.image.as_deref().unwrap_or_default();
        let status_image_id = cs.image_id.as_deref().unwrap_or_default();
        let sole_container_image = if pod_images.len() == 1 {
            pod_images.first().map(String::as_str)
        } else {
            None
        };

        let (image_name, recovered_digest) = canonical_container_image(
            status_image,
            status_image_id,
            &image_by_digest,
            sole_container_image,
        );
        if image_name.is_empty() {
            warn!(pod = %pod_name, namespace, "container status has no resolvable image name");
            continue;
        }

        let ipbo = cs
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            == Some("ImagePullBackOff");

        let mut phase_flags = PhaseFlags::default();
        match phase {
            "Running" => phase_flags.running = true,
            "Pending" => phase_flags.pending = true,
            "Succeeded" => phase_flags.succeeded = true,
            "Failed" => phase_flags.failed = true,
            _ => phase_flags.unknown = true,
        }
        phase_flags.image_pull_back_off = ipbo;

        let c_age_days = if cs.state.as_ref().and_then(|s| s.running.as_ref()).is_some() {
            0.0
        } else {
            // Mirrors k8s-inventory.py's `elif pod_age > 0 and
            // c.state.terminated is not None:` guard: a terminated
            // sibling container on an otherwise-live pod must not push
            // c_age_days above 0, or the Running/Pending/IPBO invariant
            // below is violated.
            match (pod_age_days > 0.0, cs.state.as_ref().and_then(|s| s.terminated.as_ref())) {
                (true, Some(terminated)) => {
                    (Utc::now() - terminated.started_at.as_ref().map(|t| t.0).unwrap_or_else(Utc::now))
                        .num_seconds() as f64
                        / 86400.0
                },
                _ => pod_age_days,
            }
        };
        let c_age_days = c_age_days.max(0.0);

        if c_age_days > max_age_days && !phase_flags.is_live() {
            continue;
        }

        let key = UsageRecord::occurrence_key(context, namespace, pod_name);
        let record = usage.entry(image_name).or_insert_with(|| UsageRecord {
            last_wanted_days: f64::INFINITY,
            ..Default::default()
        });
        record.phase_any.merge(&phase_flags);
        record.last_wanted_days = record.last_wanted_days.min(c_age_days);
        if let Some(digest) = recovered_digest {
            record.digest = Some(digest);
        }

        record.occurrences.insert(
            key,
            Occurrence {
                phase: phase_flags,
                last_wanted_days: c_age_days,
                node: spec.node_name.clone(),
            },
        );
        touched = true;
    }

    touched
}

fn collect_cronjob(cronjob: &CronJob, usage: &mut ImageUsage) -> usize {
    let Some(containers) = cronjob
        .spec
        .as_ref()
        .and_then(|s| s.job_template.spec.as_ref())
        .and_then(|j| j.template.spec.as_ref())
        .map(|p| &p.containers)
    else {
        return 0;
    };

    let mut count = 0;
    for container in containers {
        let Some(image) = &container.image else {
            continue;
        };
        if image.is_empty() {
            continue;
        }
        let record = usage.entry(image.clone()).or_insert_with(|| UsageRecord {
            last_wanted_days: f64::INFINITY,
            ..Default::default()
        });
        record.cronjob = true;
        record.last_wanted_days = record.last_wanted_days.min(0.0);
        count += 1;
    }
    count
}

/// Merge one context's partial `ImageUsage` into the accumulator.
/// Occurrence keys already carry the context, so they never collide
/// across contexts; record-level attributes are merged rather than
/// overwritten.
fn merge_into(target: &mut ImageUsage, addition: ImageUsage) {
    for (key, incoming) in addition {
        match target.get_mut(&key) {
            Some(existing) => {
                existing.phase_any.merge(&incoming.phase_any);
                existing.last_wanted_days = existing.last_wanted_days.min(incoming.last_wanted_days);
                existing.cronjob |= incoming.cronjob;
                if existing.digest.is_none() {
                    existing.digest = incoming.digest;
                }
                existing.occurrences.extend(incoming.occurrences);
            },
            None => {
                target.insert(key, incoming);
            },
        }
    }
}
