use clap::Parser;
use st0x_rebalancer::config::{Env, setup_tracing};
use st0x_rebalancer::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = Env::parse().into_ctx()?;

    let telemetry_guard = if let Some(ref hyperdx) = ctx.hyperdx {
        match hyperdx.setup_telemetry() {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Failed to setup telemetry: {e}");
                setup_tracing(ctx.log_level);
                None
            }
        }
    } else {
        setup_tracing(ctx.log_level);
        None
    };

    let result = launch(ctx).await;

    // Flush pending spans before the process exits.
    drop(telemetry_guard);

    result
}
