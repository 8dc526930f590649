//! Host-side client for the Bus Pirate BPIO2 binary protocol.

pub mod bpio;
pub mod commands;
pub mod settings;

#[cfg(test)]
mod test_helpers;
