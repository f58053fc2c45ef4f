//! Fetch an asset from a node by hex-encoded SHA-1 identifier and dump it to
//! stdout.
//!
//! ```sh
//! cargo run --example fetch -- /tmp/bithorde 2aae6c35c94fcfb415dbe95f408b9ce91ee846ed
//! ```

use std::{io::Write, time::Duration};

use anyhow::{Context, Result, bail};

use bithorde_sdk::{Client, ClientOptions};
use codec::message::{HashType, Identifier, Status};

fn parse_hex(digest: &str) -> Result<Vec<u8>> {
    anyhow::ensure!(digest.len() % 2 == 0, "odd-length digest");

    (0..digest.len())
        .step_by(2)
        .map(|at| u8::from_str_radix(&digest[at..at + 2], 16).context("bad hex digit"))
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(address), Some(digest)) = (args.next(), args.next()) else {
        bail!("usage: fetch <host:port | /socket/path> <sha1-hex>");
    };

    let client = Client::connect(&address, ClientOptions::default()).await?;
    eprintln!("connected to {:?}", client.peer_name());

    let ids = vec![Identifier::new(HashType::SHA1, parse_hex(&digest)?)];
    let mut asset = client.bind_read(ids).await?;

    let update = asset.next_status().await.context("session went away")?;
    if update.status != Status::Success {
        bail!("bind answered {:?}", update.status);
    }

    let size = asset.size().unwrap_or(0);
    eprintln!("asset found, {} bytes", size);

    let mut stdout = std::io::stdout().lock();
    let mut offset = 0u64;
    while offset < size {
        let reply = asset.read(offset, 64 * 1024, Duration::from_secs(5)).await?;
        if reply.status != Status::Success {
            bail!("read at {} answered {:?}", offset, reply.status);
        }
        if reply.content.is_empty() {
            bail!("short read at {}", offset);
        }

        stdout.write_all(&reply.content)?;
        offset += reply.content.len() as u64;
    }

    Ok(())
}
