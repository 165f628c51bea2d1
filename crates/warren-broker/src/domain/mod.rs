pub mod consumer_manager;
pub mod message_handler;
pub mod topology_manager;
