pub fn init() {
    use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

    let _ = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .try_init();
}
