//! Stage a local file through a verifying channel and watch progress.
//!
//! ```text
//! cargo run --example prebuffer -- <source> <reference.mref> <cache>
//! ```

use core::time::Duration;
use std::env;
use std::sync::Arc;

use vecdata_channel::{ChannelOptions, MerkleChannel};
use vecdata_transport::FileTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let (Some(source), Some(reference), Some(cache)) = (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: prebuffer <source> <reference.mref> <cache>");
        std::process::exit(3);
    };

    let transport = Arc::new(FileTransport::new(source));
    let channel = MerkleChannel::open(transport, ChannelOptions::new(reference, cache)).await?;

    let progress = channel.prebuffer(0, channel.size());
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            () = progress.wait() => break,
            _ = ticker.tick() => {
                println!(
                    "{:5.1}%  {:?} Mbit/s  eta {:?}s",
                    progress.fraction_complete() * 100.0,
                    progress.rate_mbit_per_sec(),
                    progress.eta_seconds(),
                );
            }
        }
    }

    for failure in progress.failures() {
        eprintln!("failed: {failure}");
    }

    println!(
        "{} of {} chunks verified",
        channel.state().count_valid(),
        channel.shape().chunk_count(),
    );

    channel.close().await?;
    Ok(())
}
