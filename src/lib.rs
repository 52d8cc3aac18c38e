pub mod client;
pub mod commands;
pub mod context;
pub mod crypto;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod mailbox;
pub mod message;
pub mod relay;
pub mod states;

use std::time::Duration;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

pub const DEFAULT_RELAY_PORT: u16 = 10001;
pub const DEFAULT_RELAY_ADDRESS: &str = "0.0.0.0:10001";
pub const DEFAULT_RELAY_PASSWORD: &str = "abc123";
pub const DEFAULT_APP_ID: &str = "relay-app-id";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
