pub mod binding;
pub mod exchange;
pub mod registry;
pub mod strategies;

pub use binding::BindingTable;
pub use exchange::{Exchange, ExchangeInfo};
pub use registry::{Router, DEFAULT_EXCHANGE};
pub use strategies::direct::DirectStrategy;
pub use strategies::fanout::FanoutStrategy;
pub use strategies::topic::TopicStrategy;
pub use strategies::RoutingStrategy;
