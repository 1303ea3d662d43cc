use ec2_state_manager::{AwsCloudProvider, Config, StateManagerService};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    // Missing or invalid configuration is fatal before any invocation is served.
    let config = Config::from_env()?;
    let provider = AwsCloudProvider::new().await;
    let service = StateManagerService::new(provider, config);
    let service = &service;

    run(service_fn(move |event: LambdaEvent<Value>| async move {
        service.handle(event).await
    }))
    .await
}
