use crate::{
    core::{InheritedPolicyPriority, DEFAULT_CONTROLLER_NAME},
    driver::{self, Driver},
    metrics::DriverMetrics,
    snapshot::FileSnapshotSource,
    status,
    translate::{
        plugins::{self, PluginConfig},
        GatewayTranslator,
    },
    validator::{
        BinaryValidator, DockerValidator, Validator, DEFAULT_VALIDATOR_IMAGE,
        DEFAULT_VALIDATOR_PATH,
    },
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of status patches to buffer. As a conservative estimate,
// we assume that sending a patch will take at least 1ms, so we set the buffer
// size to be the same as the reconciliation period in milliseconds.
const STATUS_UPDATE_QUEUE_SIZE: usize = RECONCILIATION_PERIOD.as_millis() as usize;

#[derive(Debug, Parser)]
#[clap(
    name = "gateway-policy-controller",
    about = "Attaches policies to gateways and renders proxy configuration"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "gateway=info,warn",
        env = "GATEWAY_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// A YAML document describing gateways, routes, backends, and policies.
    #[clap(long)]
    snapshot_path: PathBuf,

    #[clap(long, default_value = "10")]
    snapshot_interval_secs: u64,

    /// The controller name written to policy ancestor statuses.
    #[clap(long, default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    #[clap(long, value_enum, default_value = "none")]
    validator: ValidatorMode,

    #[clap(long, default_value = DEFAULT_VALIDATOR_PATH)]
    validator_path: PathBuf,

    #[clap(long, default_value = DEFAULT_VALIDATOR_IMAGE)]
    validator_image: String,

    #[clap(long, default_value = "30")]
    validation_timeout_secs: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// Applies only the highest priority TrafficPolicy to each target.
    #[clap(long)]
    disable_traffic_policy_merge: bool,

    /// Whether policies inherited from a parent outrank policies attached to
    /// a child (`prefer-parent`) or not (`prefer-child`).
    #[clap(long, default_value = "prefer-child")]
    inherited_policy_priority: InheritedPolicyPriority,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum ValidatorMode {
    None,
    Binary,
    Docker,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let validator = self.validator();
        let Self {
            admin,
            client,
            log_level,
            log_format,
            snapshot_path,
            snapshot_interval_secs,
            controller_name,
            patch_timeout_ms,
            disable_traffic_policy_merge,
            inherited_policy_priority,
            ..
        } = self;

        let registry = Arc::new(plugins::registry(&PluginConfig {
            disable_traffic_policy_merge,
        })?);
        let translator = GatewayTranslator::new(registry.clone(), inherited_policy_priority);

        let mut prom = <Registry>::default();
        let resource_status = prom.sub_registry_with_prefix("resource_status");
        let status_metrics = status::ControllerMetrics::register(resource_status);
        let status_index_metrics = status::IndexMetrics::register(resource_status);
        let driver_metrics = DriverMetrics::register(prom.sub_registry_with_prefix("translation"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the status index which will maintain information necessary for
        // updating the status field of policy resources.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_index =
            status::Index::shared(controller_name, updates_tx, status_index_metrics);

        let (snapshots, snapshots_rx) =
            FileSnapshotSource::new(snapshot_path, Duration::from_secs(snapshot_interval_secs));
        tokio::spawn(snapshots.run().instrument(info_span!("snapshots")));

        let (driver, outputs) = Driver::new(
            translator,
            validator,
            status_index,
            snapshots_rx,
            driver_metrics,
        );
        tokio::spawn(driver.run().instrument(info_span!("driver")));
        tokio::spawn(driver::log_outputs(outputs).instrument(info_span!("outputs")));

        let status_controller = status::Controller::new(
            runtime.client(),
            registry.kinds().cloned(),
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn validator(&self) -> Option<Arc<dyn Validator>> {
        let timeout = Duration::from_secs(self.validation_timeout_secs);
        match self.validator {
            ValidatorMode::None => None,
            ValidatorMode::Binary => Some(Arc::new(BinaryValidator::new(
                self.validator_path.clone(),
                timeout,
            ))),
            ValidatorMode::Docker => Some(Arc::new(DockerValidator::new(
                &self.validator_image,
                timeout,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from([
            "gateway-policy-controller",
            "--snapshot-path",
            "/etc/gateway/snapshot.yaml",
        ])
        .unwrap();
        assert_eq!(args.controller_name, DEFAULT_CONTROLLER_NAME);
        assert_eq!(args.validator, ValidatorMode::None);
        assert_eq!(
            args.inherited_policy_priority,
            InheritedPolicyPriority::PreferChild
        );
        assert!(!args.disable_traffic_policy_merge);
        assert!(args.validator().is_none());
    }

    #[test]
    fn validator_flags() {
        let args = Args::try_parse_from([
            "gateway-policy-controller",
            "--snapshot-path",
            "snapshot.yaml",
            "--validator",
            "docker",
            "--validation-timeout-secs",
            "5",
            "--inherited-policy-priority",
            "prefer-parent",
            "--disable-traffic-policy-merge",
        ])
        .unwrap();
        assert_eq!(args.validator, ValidatorMode::Docker);
        assert_eq!(args.validator_image, DEFAULT_VALIDATOR_IMAGE);
        assert_eq!(
            args.inherited_policy_priority,
            InheritedPolicyPriority::PreferParent
        );
        assert!(args.disable_traffic_policy_merge);
        assert!(args.validator().is_some());
    }

    #[test]
    fn rejects_unknown_priorities() {
        assert!(Args::try_parse_from([
            "gateway-policy-controller",
            "--snapshot-path",
            "snapshot.yaml",
            "--inherited-policy-priority",
            "prefer-nobody",
        ])
        .is_err());
    }
}
