#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use bithorde_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.server.tcp_listen.is_none() && config.server.local_socket.is_none() {
        log::warn!("No listeners are bound, it's just a program without any functionality :-)");
        return Ok(());
    }

    bithorde_server::startup(config).await
}
