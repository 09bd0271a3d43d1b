//! Peer-to-peer messaging over UDP with ordered delivery: broadcasts are delivered in causal
//!  order (based on vector clocks), private messages in FIFO order per sender.
//!
//! Every node knows the full, fixed list of participants. Transport is best effort with
//!  acknowledgements and a bounded number of retransmissions, while duplicates are filtered on
//!  the receiving side.

pub mod ordering;
pub mod messaging;
pub mod node;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
