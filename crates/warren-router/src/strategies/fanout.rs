use super::RoutingStrategy;
use crate::binding::BindingTable;
use std::collections::BTreeSet;
use warren_internals::{ExchangeKind, QueueName, WarrenError};

pub struct FanoutStrategy;

impl RoutingStrategy for FanoutStrategy {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Fanout
    }

    fn route(
        &self,
        _routing_key: &str,
        bindings: &BindingTable,
    ) -> Result<BTreeSet<QueueName>, WarrenError> {
        // Broadcast: the key and the patterns are both ignored.
        bindings.all_queues()
    }
}
