use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Instant, SystemTime},
};
use uuid::Uuid;

use crate::errors::WarrenError;

pub type QueueName = String;
pub type ConsumerTag = String;
pub type DeliveryTag = u64;
pub type ConnectionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        };
        f.write_str(name)
    }
}

impl FromStr for ExchangeKind {
    type Err = WarrenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(WarrenError::InvalidArgument(format!(
                "unknown exchange type '{}'",
                other
            ))),
        }
    }
}

/// Declaration flags of a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Queue definition (and its persistent messages) survive a restart.
    pub durable: bool,
    /// Queue belongs to the declaring connection and is deleted with it.
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
        }
    }
}

/// Publisher-supplied properties. Opaque to routing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub persistent: bool,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[derive(Clone, PartialEq, Default, Debug, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Arc<Vec<u8>>,
    pub properties: MessageProperties,
    #[serde(skip)]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: Arc::new(payload.into()),
            properties,
            metadata: Some(MessageMetadata {
                published_at: Some(SystemTime::now()),
                arrival_time: None,
            }),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.properties.persistent
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct MessageMetadata {
    pub published_at: Option<SystemTime>,
    pub arrival_time: Option<Instant>,
}

/// A single hand-off of a queued message to a consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    /// `None` for deliveries obtained with a synchronous get.
    pub consumer_tag: Option<ConsumerTag>,
    pub redelivered: bool,
    pub message: Message,
}

impl Delivery {
    pub fn exchange(&self) -> &str {
        &self.message.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.message.properties
    }
}
