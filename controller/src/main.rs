mod actuator;
mod hardware;
mod host;
mod supervisor;
mod thermometer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
