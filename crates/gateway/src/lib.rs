//! # Meridian Gateway
//!
//! Gateway process of the Meridian platform. Hosts the service registry,
//! the health monitor and the message bus, and exposes the bus endpoints
//! backend services register and deliver through.
//!
//! ## Lifecycle
//!
//! 1. Parse CLI options and initialise logging
//! 2. Build the bus, opening the durable queue
//! 3. Register the services listed in the manifest, if any
//! 4. Recover stored CRITICAL messages and open the bus
//! 5. Start health monitoring and serve until Ctrl-C
//! 6. Stop the monitor and the bus

pub mod cli_options;
pub mod manifest;

pub use cli_options::GatewayCliOptions;
pub use manifest::ServiceManifest;
