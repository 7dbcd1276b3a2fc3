//! Attaches to a running `listen` example as Client and sends each remaining
//! argument as one message.

use std::error::Error;

use shmpoke::{Channel, ChannelNames, Role};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        return Err(format!("usage: {} <prefix> <message>...", args[0]).into());
    }

    let channel = Channel::options()
        .role(Role::Client)
        .names(ChannelNames::with_prefix(&args[1]))
        .open()?;

    for msg in &args[2..] {
        channel.send(msg)?;
    }
    Ok(())
}
