mod client;
mod proto;

pub use client::Client;

#[cfg(test)]
pub use client::tests::stub_server;
