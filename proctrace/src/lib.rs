pub mod channel;
pub mod clock;
pub mod config;
pub mod core_logic;
pub mod event_bus;
pub mod loader;
pub mod logger;
pub mod process_tree;
pub mod publisher;
pub mod service_manager;
pub mod signal_handler;
pub mod stats;
pub mod subscriber;
pub mod tracefs;
pub mod tracer;
