use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_ec2::{types::Filter, Client as Ec2Client};
use lambda_runtime::LambdaEvent;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    /// Resolves the configured action string, accepting the documented synonyms.
    pub fn parse(value: &str) -> Result<Self, ManagerError> {
        match value {
            "enable" | "start" => Ok(Self::Start),
            "disable" | "stop" => Ok(Self::Stop),
            other => Err(ManagerError::Configuration(format!(
                "unexpected action {other:?}, expected one of enable|start|disable|stop"
            ))),
        }
    }

    /// The lifecycle state an instance must currently be in to be a candidate
    /// for this action.
    pub fn source_state(self) -> &'static str {
        match self {
            Self::Start => "stopped",
            Self::Stop => "running",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Immutable invocation configuration, built once at startup from the
/// environment and passed into the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub tag_key: String,
    pub tag_value: String,
    pub regions: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ManagerError> {
        let action = Action::parse(&required_var("ACTION")?)?;
        let tag_key = required_var("RESOURCE_TAG_KEY")?;
        let tag_value = required_var("RESOURCE_TAG_VALUE")?;
        let regions = parse_regions(&required_var("AWS_REGIONS")?)?;

        Ok(Self {
            action,
            tag_key,
            tag_value,
            regions,
        })
    }
}

fn required_var(name: &str) -> Result<String, ManagerError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ManagerError::Configuration(format!(
            "missing required environment variable {name}"
        ))),
    }
}

/// Splits a comma-separated region list, ignoring blank entries.
pub fn parse_regions(raw: &str) -> Result<Vec<String>, ManagerError> {
    let regions: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .map(str::to_string)
        .collect();

    if regions.is_empty() {
        return Err(ManagerError::Configuration(
            "AWS_REGIONS must list at least one region".to_string(),
        ));
    }

    Ok(regions)
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    DirectoryQuery(String),

    #[error("{0}")]
    MembershipQuery(String),

    #[error("instance {instance_id}: {message}")]
    Transition {
        instance_id: String,
        message: String,
    },

    #[error("{0}")]
    Unexpected(String),
}

impl ManagerError {
    /// Classification name carried in the failure envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::DirectoryQuery(_) => "DirectoryQueryError",
            Self::MembershipQuery(_) => "MembershipQueryError",
            Self::Transition { .. } => "TransitionError",
            Self::Unexpected(_) => "UnexpectedError",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Response {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: ResponseBody,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ResponseBody {
    Text(String),
    Error(ErrorBody),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "httpStatus")]
    pub http_status: u16,
    pub message: String,
    pub trace: Vec<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            body: ResponseBody::Text(String::new()),
        }
    }

    pub fn from_error(err: &ManagerError) -> Self {
        Self {
            status_code: 500,
            body: ResponseBody::Error(ErrorBody {
                http_status: 500,
                message: format!("{} {}", err.kind(), err),
                trace: error_trace(err),
            }),
        }
    }
}

/// Renders an error and its source chain as diagnostic trace lines.
pub fn error_trace(err: &dyn std::error::Error) -> Vec<String> {
    let mut trace = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        trace.push(cause.to_string());
        source = cause.source();
    }
    trace
}

/// Result of one region pass. `error` stays unset in the default fail-fast
/// mode, where a region failure aborts the whole invocation instead.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RegionOutcome {
    pub region: String,
    pub candidate_count: usize,
    pub transitioned_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Instances matching the tag/state filter in one region, split into the raw
/// candidate count and the ids left after the Auto Scaling exclusion.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSelection {
    pub candidate_count: usize,
    pub eligible: Vec<String>,
}

/// Seam between the orchestration logic and the AWS APIs. Every call is
/// scoped to a single region.
#[allow(async_fn_in_trait)]
pub trait CloudProvider {
    async fn find_instances(
        &self,
        region: &str,
        tag_key: &str,
        tag_value: &str,
        lifecycle_state: &str,
    ) -> Result<Vec<String>, ManagerError>;

    async fn is_group_managed(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<bool, ManagerError>;

    async fn start_instance(&self, region: &str, instance_id: &str) -> Result<(), ManagerError>;

    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<(), ManagerError>;
}

/// Live AWS implementation. Holds one shared SDK config and derives
/// region-scoped EC2 and Auto Scaling clients from it per call.
pub struct AwsCloudProvider {
    config: SdkConfig,
}

impl AwsCloudProvider {
    pub async fn new() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self { config }
    }

    fn ec2_client(&self, region: &str) -> Ec2Client {
        let conf = aws_sdk_ec2::config::Builder::from(&self.config)
            .region(Region::new(region.to_string()))
            .build();
        Ec2Client::from_conf(conf)
    }

    fn autoscaling_client(&self, region: &str) -> AutoScalingClient {
        let conf = aws_sdk_autoscaling::config::Builder::from(&self.config)
            .region(Region::new(region.to_string()))
            .build();
        AutoScalingClient::from_conf(conf)
    }
}

impl CloudProvider for AwsCloudProvider {
    async fn find_instances(
        &self,
        region: &str,
        tag_key: &str,
        tag_value: &str,
        lifecycle_state: &str,
    ) -> Result<Vec<String>, ManagerError> {
        let client = self.ec2_client(region);

        let tag_filter = Filter::builder()
            .name(format!("tag:{tag_key}"))
            .values(tag_value)
            .build();
        let state_filter = Filter::builder()
            .name("instance-state-name")
            .values(lifecycle_state)
            .build();

        let mut instance_ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = client
                .describe_instances()
                .filters(tag_filter.clone())
                .filters(state_filter.clone());

            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }

            let page = request.send().await.map_err(|e| {
                ManagerError::DirectoryQuery(format!(
                    "describe_instances failed in {region}: {e}"
                ))
            })?;

            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    if let Some(id) = instance.instance_id() {
                        instance_ids.push(id.to_string());
                    }
                }
            }

            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(instance_ids)
    }

    async fn is_group_managed(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<bool, ManagerError> {
        let response = self
            .autoscaling_client(region)
            .describe_auto_scaling_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| {
                ManagerError::MembershipQuery(format!(
                    "describe_auto_scaling_instances failed for {instance_id} in {region}: {e}"
                ))
            })?;

        Ok(!response.auto_scaling_instances().is_empty())
    }

    async fn start_instance(&self, region: &str, instance_id: &str) -> Result<(), ManagerError> {
        self.ec2_client(region)
            .start_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ManagerError::Transition {
                instance_id: instance_id.to_string(),
                message: format!("start_instances failed in {region}: {e}"),
            })?;

        Ok(())
    }

    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<(), ManagerError> {
        self.ec2_client(region)
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| ManagerError::Transition {
                instance_id: instance_id.to_string(),
                message: format!("stop_instances failed in {region}: {e}"),
            })?;

        Ok(())
    }
}

pub struct StateManagerService<P> {
    provider: P,
    config: Config,
}

impl<P: CloudProvider> StateManagerService<P> {
    pub fn new(provider: P, config: Config) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Queries the instance directory for tag/state matches, then keeps each
    /// id iff it does not belong to an Auto Scaling group. Every candidate is
    /// checked, so skipped instances always show up in the debug log.
    pub async fn select_eligible(&self, region: &str) -> Result<RegionSelection, ManagerError> {
        let candidates = self
            .provider
            .find_instances(
                region,
                &self.config.tag_key,
                &self.config.tag_value,
                self.config.action.source_state(),
            )
            .await?;

        let candidate_count = candidates.len();
        let mut eligible = Vec::with_capacity(candidate_count);

        for instance_id in candidates {
            if self.provider.is_group_managed(region, &instance_id).await? {
                debug!(
                    %region,
                    %instance_id,
                    "Instance is not eligible: part of an Auto Scaling group"
                );
            } else {
                debug!(%region, %instance_id, "Instance is eligible");
                eligible.push(instance_id);
            }
        }

        Ok(RegionSelection {
            candidate_count,
            eligible,
        })
    }

    /// Issues one start or stop call per instance, in order, failing fast on
    /// the first provider error. An empty input is a no-op, not an error.
    pub async fn transition_instances(
        &self,
        region: &str,
        instance_ids: &[String],
    ) -> Result<usize, ManagerError> {
        if instance_ids.is_empty() {
            info!(%region, "No eligible instances, nothing to do");
            return Ok(0);
        }

        let mut transitioned = 0;
        for instance_id in instance_ids {
            match self.config.action {
                Action::Start => {
                    debug!(%region, %instance_id, "Starting instance");
                    self.provider.start_instance(region, instance_id).await?;
                    info!(%region, %instance_id, "Instance => [RUNNING]");
                }
                Action::Stop => {
                    debug!(%region, %instance_id, "Stopping instance");
                    self.provider.stop_instance(region, instance_id).await?;
                    info!(%region, %instance_id, "Instance => [STOPPED]");
                }
            }
            transitioned += 1;
        }

        Ok(transitioned)
    }

    async fn region_pass(&self, region: &str) -> Result<RegionOutcome, ManagerError> {
        info!(
            %region,
            tag_key = %self.config.tag_key,
            tag_value = %self.config.tag_value,
            state = %self.config.action.source_state(),
            "Searching EC2 instances"
        );

        let selection = self.select_eligible(region).await?;
        info!(
            %region,
            candidates = selection.candidate_count,
            eligible = selection.eligible.len(),
            "Instance selection complete"
        );

        let transitioned = self
            .transition_instances(region, &selection.eligible)
            .await?;

        Ok(RegionOutcome {
            region: region.to_string(),
            candidate_count: selection.candidate_count,
            transitioned_count: transitioned,
            error: None,
        })
    }

    /// Runs one selection+transition pass per configured region, in order.
    /// The first provider error aborts the remaining regions and fails the
    /// whole invocation.
    pub async fn run(&self) -> Result<Vec<RegionOutcome>, ManagerError> {
        let mut outcomes = Vec::with_capacity(self.config.regions.len());

        for region in &self.config.regions {
            match self.region_pass(region).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(%region, error = %err, "Region pass aborted, failing the invocation");
                    return Err(err);
                }
            }
        }

        Ok(outcomes)
    }

    /// Entry point: always produces a response envelope. The trigger payload
    /// is opaque and only traced, never inspected.
    pub async fn handle(
        &self,
        event: LambdaEvent<Value>,
    ) -> Result<Response, lambda_runtime::Error> {
        debug!(
            request_id = %event.context.request_id,
            payload = %event.payload,
            "Invocation received"
        );
        info!(action = %self.config.action, "Starting the operation");

        match self.run().await {
            Ok(outcomes) => {
                let transitioned: usize = outcomes.iter().map(|o| o.transitioned_count).sum();
                info!(
                    regions = outcomes.len(),
                    transitioned, "Operation completed successfully"
                );
                Ok(Response::ok())
            }
            Err(err) => {
                error!(kind = err.kind(), error = %err, "Operation failed");
                Ok(Response::from_error(&err))
            }
        }
    }
}
