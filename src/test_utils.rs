use tracing_subscriber::{fmt, EnvFilter};

/// Print spans and events of the test being run, filtered by `RUST_LOG`.
pub(crate) fn trace_init() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
