pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(opts: app::RunOptions) -> anyhow::Result<()> {
    app::run(opts).await
}
