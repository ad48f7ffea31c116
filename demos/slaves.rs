//! list the slaves of a segment with their identity and state
//!
//! usage: `cargo run --example slaves -- [link]`, the link defaults to a simulated segment

use std::error::Error;
use etherplc::{MasterContext, MasterConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let link = std::env::args().nth(1).unwrap_or_else(|| "sim:3".to_owned());

    let mut master = MasterContext::open(&link, MasterConfig::default())?;
    master.enumerate().await?;
    master.negotiate_from_sync_managers().await?;

    for slave in master.registry() {
        let identity = slave.identity();
        let size = slave.size_or_empty();
        println!("slave {} at {:#06x} (alias {}): {:?}",
            slave.position(),
            slave.configured_address(),
            slave.alias_address(),
            identity.name,
            );
        println!("  vendor {:#010x}  product {:#010x}  revision {:#010x}  serial {}",
            identity.vendor,
            identity.product,
            identity.revision,
            identity.serial,
            );
        println!("  {} input bits, {} output bits, {}",
            size.input_bits,
            size.output_bits,
            slave.state(),
            );
    }
    println!("segment in {}", master.bus_state());

    master.close();
    Ok(())
}
