pub mod dispatch;
pub mod queue;
pub mod store;

pub use dispatch::{Consumer, DeliveryStream};
pub use queue::{Queue, QueueContext, QueueStats};
pub use store::{
    BindingRecord, ExchangeRecord, MemoryStore, MessageStore, QueueRecord, SledStore, StoreError,
    StoreSnapshot,
};
