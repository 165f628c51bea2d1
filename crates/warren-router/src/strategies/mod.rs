pub mod direct;
pub mod fanout;
pub mod topic;

use crate::binding::BindingTable;
use std::collections::BTreeSet;
use warren_internals::{ExchangeKind, QueueName, WarrenError};

/// Selects the target queues of a publish from an exchange's bindings.
///
/// Implementations must be pure: the result depends only on the routing key
/// and the bindings currently registered.
pub trait RoutingStrategy: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    fn route(
        &self,
        routing_key: &str,
        bindings: &BindingTable,
    ) -> Result<BTreeSet<QueueName>, WarrenError>;
}

pub fn for_kind(kind: ExchangeKind) -> Box<dyn RoutingStrategy> {
    match kind {
        ExchangeKind::Direct => Box::new(direct::DirectStrategy),
        ExchangeKind::Fanout => Box::new(fanout::FanoutStrategy),
        ExchangeKind::Topic => Box::new(topic::TopicStrategy),
    }
}
