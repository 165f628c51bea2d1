pub mod errors;
pub mod structs;

pub use errors::WarrenError;
pub use structs::{
    ConnectionId, ConsumerTag, Delivery, DeliveryTag, ExchangeKind, Message, MessageMetadata,
    MessageProperties, QueueName, QueueOptions,
};
