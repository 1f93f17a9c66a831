use cloudburst::testing::LoopbackDriver;
use cloudburst::{Instance, Options};
use std::sync::Arc;

/// Options suitable for tests: no machine-wide GC side effects.
pub fn options() -> Options {
    Options::new().gc(false)
}

pub async fn queued_instance(options: Options) -> (Arc<LoopbackDriver>, Instance) {
    let driver = Arc::new(LoopbackDriver::queued());
    let instance = Instance::initialize(driver.clone(), options).await.expect("initialize");
    (driver, instance)
}

pub async fn sync_instance(options: Options) -> (Arc<LoopbackDriver>, Instance) {
    let driver = Arc::new(LoopbackDriver::sync_only());
    let instance = Instance::initialize(driver.clone(), options).await.expect("initialize");
    (driver, instance)
}
