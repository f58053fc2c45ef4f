pub mod config;
pub mod server;
pub mod statistics;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use service::{AssetStore, Router, RouterOptions};

use self::{config::Config, statistics::Statistics, store::LinkStore};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "bithorde.",
    env!("CARGO_PKG_VERSION")
);

/// Everything a running node is made of. Dropping it hangs up the upstream
/// sessions.
pub struct Node {
    pub router: Arc<Router>,
    pub statistics: Statistics,
    upstreams: Vec<sdk::Client>,
}

impl Node {
    pub fn upstreams(&self) -> usize {
        self.upstreams.len()
    }
}

/// Build stores, dial upstreams, and assemble the router.
pub fn bootstrap(config: &Config) -> Result<Node> {
    let mut stores: Vec<Arc<dyn AssetStore>> = Vec::new();
    for storage in &config.storage {
        stores.push(Arc::new(LinkStore::open(&storage.path)?));
    }

    let router = Router::with_options(
        stores,
        RouterOptions {
            discovery_timeout: config.routing.discovery_timeout(),
            forward_read_timeout: config.routing.forward_read_timeout(),
        },
    );

    let mut upstreams = Vec::new();
    for upstream in &config.upstream {
        let client = sdk::Client::new(
            upstream.address.parse()?,
            sdk::ClientOptions {
                name: config.name.clone(),
                bind_timeout: config.bind.timeout(),
                refresh_multiplier: config.bind.refresh_multiplier,
                ..Default::default()
            },
        );

        log::info!(
            "upstream {:?} at {} configured",
            upstream.name,
            upstream.address
        );
        router.add_upstream(upstream.name.clone(), client.session().clone());
        upstreams.push(client);
    }

    Ok(Node {
        router,
        statistics: Statistics::default(),
        upstreams,
    })
}

/// In order to let the integration tests start a node the same way the
/// binary does, the whole startup path is a library function.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    log::info!("starting {}", SOFTWARE);

    let node = bootstrap(&config)?;
    server::start(&config, &node.statistics, &node.router).await?;

    // Listeners run on their own tasks; park here keeping `node` (and with
    // it the upstream sessions) alive.
    std::future::pending::<()>().await;
    drop(node);
    Ok(())
}
