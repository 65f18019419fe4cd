pub mod address_cache;
pub mod bundler;
pub mod dispatch_pool;
pub mod pending_resolutions;
pub mod transport;
pub mod transport_config;
pub mod transport_events;
pub mod up_handler;
pub mod wire_format;
pub mod wire_sender;
