//! Provisions the channel as Server and prints every message until Ctrl-D
//! or a "quit" message. Pair it with the `poke` example in another shell,
//! possibly as another user.

use std::error::Error;
use std::io::Read;
use std::sync::mpsc;
use std::sync::Mutex;

use shmpoke::{Channel, ChannelNames, Role};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let prefix = std::env::args()
        .nth(1)
        .ok_or("usage: listen <prefix>")?;
    let channel = Channel::options()
        .role(Role::Server)
        .names(ChannelNames::with_prefix(&prefix))
        .open()?;

    let (quit_tx, quit_rx) = mpsc::channel();
    let eof_tx = quit_tx.clone();
    let quit_tx = Mutex::new(quit_tx);
    channel.subscribe(move |msg| {
        println!("{}", msg.data());
        if msg.data() == "quit" {
            quit_tx.lock().map_err(|_| "quit channel poisoned")?.send(())?;
        }
        Ok(())
    });
    channel.init()?;

    // Either stdin closing or a "quit" message ends the demo.
    std::thread::spawn(move || {
        let _ = std::io::stdin().read_to_end(&mut Vec::new());
        let _ = eof_tx.send(());
    });
    quit_rx.recv()?;

    channel.shutdown()?;
    Ok(())
}
