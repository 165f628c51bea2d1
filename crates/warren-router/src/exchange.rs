use crate::binding::BindingTable;
use crate::strategies::{self, RoutingStrategy};
use std::collections::BTreeSet;
use warren_internals::{ExchangeKind, QueueName, WarrenError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

pub struct Exchange {
    pub name: String,
    durable: bool,
    bindings: BindingTable,
    strategy: Box<dyn RoutingStrategy>,
}

impl Exchange {
    pub fn new(name: String, kind: ExchangeKind, durable: bool) -> Self {
        Self::with_strategy(name, durable, strategies::for_kind(kind))
    }

    pub fn with_strategy(name: String, durable: bool, strategy: Box<dyn RoutingStrategy>) -> Self {
        Self {
            name,
            durable,
            bindings: BindingTable::new(),
            strategy,
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        self.strategy.kind()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn info(&self) -> ExchangeInfo {
        ExchangeInfo {
            name: self.name.clone(),
            kind: self.kind(),
            durable: self.durable,
        }
    }

    pub fn bind(&self, queue_name: &str, pattern: &str) -> Result<bool, WarrenError> {
        self.bindings.bind(queue_name, pattern)
    }

    pub fn unbind(&self, queue_name: &str, pattern: &str) -> Result<bool, WarrenError> {
        self.bindings.unbind(queue_name, pattern)
    }

    pub fn remove_queue(&self, queue_name: &str) -> Result<Vec<String>, WarrenError> {
        self.bindings.remove_queue(queue_name)
    }

    pub fn bindings(&self) -> Result<Vec<(QueueName, String)>, WarrenError> {
        self.bindings.bindings()
    }

    pub fn route(&self, routing_key: &str) -> Result<BTreeSet<QueueName>, WarrenError> {
        // Delegate the work to the strategy
        self.strategy.route(routing_key, &self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Routes to every queue whose name starts with the key
    struct PrefixStrategy;
    impl RoutingStrategy for PrefixStrategy {
        fn kind(&self) -> ExchangeKind {
            ExchangeKind::Direct
        }

        fn route(
            &self,
            routing_key: &str,
            bindings: &BindingTable,
        ) -> Result<BTreeSet<QueueName>, WarrenError> {
            Ok(bindings
                .all_queues()?
                .into_iter()
                .filter(|q| q.starts_with(routing_key))
                .collect())
        }
    }

    #[test]
    fn test_exchange_binding_management() {
        let ex = Exchange::new("logs".into(), ExchangeKind::Fanout, false);
        assert!(ex.bind("q", "").unwrap());
        assert_eq!(ex.bindings().unwrap().len(), 1);

        assert!(ex.unbind("q", "").unwrap());
        assert!(ex.bindings().unwrap().is_empty());
    }

    #[test]
    fn test_exchange_delegates_to_strategy() {
        let ex = Exchange::with_strategy("custom".into(), true, Box::new(PrefixStrategy));
        ex.bind("orders.eu", "x").unwrap();
        ex.bind("orders.us", "y").unwrap();
        ex.bind("payments", "z").unwrap();

        assert_eq!(ex.route("orders").unwrap().len(), 2);
        assert_eq!(
            ex.info(),
            ExchangeInfo {
                name: "custom".into(),
                kind: ExchangeKind::Direct,
                durable: true,
            }
        );
    }
}
