use super::RoutingStrategy;
use crate::binding::BindingTable;
use std::collections::BTreeSet;
use warren_internals::{ExchangeKind, QueueName, WarrenError};

/// Exact, case-sensitive match of routing key against binding pattern.
pub struct DirectStrategy;

impl RoutingStrategy for DirectStrategy {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Direct
    }

    fn route(
        &self,
        routing_key: &str,
        bindings: &BindingTable,
    ) -> Result<BTreeSet<QueueName>, WarrenError> {
        bindings.queues_for_pattern(routing_key)
    }
}
