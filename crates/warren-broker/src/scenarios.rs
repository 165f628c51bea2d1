use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use uuid::Uuid;
use warren_broker::{
    Broker, BrokerError, ConsumeOptions, Connection, Consumer, ExchangeKind,
    MessageProperties, QueueOptions,
};

type ScenarioResult = Result<(), Box<dyn std::error::Error>>;

const TASK_QUEUE: &str = "task_queue";
const HELLO_QUEUE: &str = "hello";
const RPC_QUEUE: &str = "rpc_queue";

/// How long an RPC client waits for its reply.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// A subscriber stops once its queue has been quiet for this long.
const IDLE: Duration = Duration::from_millis(250);

/// One message through a named queue and back.
pub async fn hello(broker: &Broker, message: &str) -> ScenarioResult {
    let connection = broker.connect();
    connection.declare_queue(HELLO_QUEUE, QueueOptions::default())?;

    connection.publish("", HELLO_QUEUE, message.as_bytes(), MessageProperties::default())?;
    println!(" [x] Sent {message}");

    let mut consumer = connection.consume(
        HELLO_QUEUE,
        ConsumeOptions::default().with_consumer_tag("rust_consumer"),
    )?;
    println!(" [*] Waiting for messages");
    while let Ok(Some(delivery)) = timeout(IDLE, consumer.recv()).await {
        connection.ack(delivery.delivery_tag)?;
        println!(" [x] Received {}", String::from_utf8_lossy(delivery.payload()));
    }
    Ok(())
}

/// Durable work queue shared by competing workers with prefetch 1.
/// Each dot in a task body costs `work_ms` of simulated work.
pub async fn work_queue(
    broker: &Broker,
    workers: usize,
    tasks: &[String],
    work_ms: u64,
) -> ScenarioResult {
    let producer = broker.connect();
    producer.declare_queue(TASK_QUEUE, QueueOptions::durable())?;

    let mut handles = Vec::with_capacity(workers);
    for worker in 1..=workers {
        let connection = broker.connect();
        connection.declare_queue(TASK_QUEUE, QueueOptions::durable())?;
        handles.push(tokio::spawn(run_worker(worker, connection, work_ms)));
    }

    for task in tasks {
        producer.publish("", TASK_QUEUE, task.as_bytes(), MessageProperties::persistent())?;
        println!(" [x] Sent {task}");
    }

    for (worker, done) in join_all(handles).await?.into_iter().enumerate() {
        info!(worker = worker + 1, done, "worker finished");
    }
    Ok(())
}

async fn run_worker(
    worker: usize,
    connection: Connection,
    work_ms: u64,
) -> Result<usize, BrokerError> {
    let mut consumer =
        connection.consume(TASK_QUEUE, ConsumeOptions::default().with_prefetch(1))?;
    let mut done = 0;
    while let Ok(Some(delivery)) = timeout(IDLE, consumer.recv()).await {
        let body = String::from_utf8_lossy(delivery.payload()).into_owned();
        println!(" [{worker}] Received {body}");
        let dots = body.chars().filter(|c| *c == '.').count() as u64;
        sleep(Duration::from_millis(dots * work_ms)).await;
        connection.ack(delivery.delivery_tag)?;
        println!(" [{worker}] Done");
        done += 1;
    }
    Ok(done)
}

/// Broadcast through a fanout exchange to every subscriber.
pub async fn pubsub(broker: &Broker, subscribers: usize, messages: &[String]) -> ScenarioResult {
    let bindings = vec![vec![String::new()]; subscribers];
    let messages: Vec<(String, String)> = messages
        .iter()
        .map(|m| (String::new(), m.clone()))
        .collect();
    fan_out(broker, "logs", ExchangeKind::Fanout, &bindings, &messages).await
}

/// Severity routing through a direct exchange.
pub async fn routing(
    broker: &Broker,
    subscribers: &[Vec<String>],
    messages: &[(String, String)],
) -> ScenarioResult {
    fan_out(broker, "direct_logs", ExchangeKind::Direct, subscribers, messages).await
}

/// Pattern routing through a topic exchange.
pub async fn topics(
    broker: &Broker,
    subscribers: &[Vec<String>],
    messages: &[(String, String)],
) -> ScenarioResult {
    fan_out(broker, "topic_logs", ExchangeKind::Topic, subscribers, messages).await
}

/// Every subscriber gets a server-named exclusive queue bound with its
/// patterns and consumes it with auto-ack.
async fn fan_out(
    broker: &Broker,
    exchange: &str,
    kind: ExchangeKind,
    subscribers: &[Vec<String>],
    messages: &[(String, String)],
) -> ScenarioResult {
    let mut handles = Vec::with_capacity(subscribers.len());
    for (index, patterns) in subscribers.iter().enumerate() {
        let connection = broker.connect();
        connection.declare_exchange(exchange, kind, false)?;
        let queue = connection.declare_queue("", QueueOptions::exclusive())?;
        for pattern in patterns {
            connection.bind_queue(&queue, exchange, pattern)?;
        }
        println!(" [{}] Waiting for logs on {queue} ({})", index + 1, patterns.join(" "));
        handles.push(tokio::spawn(run_subscriber(index + 1, connection, queue)));
    }

    let publisher = broker.connect();
    publisher.declare_exchange(exchange, kind, false)?;
    for (key, body) in messages {
        let routed = publisher.publish(exchange, key, body.as_bytes(), MessageProperties::default())?;
        if routed == 0 {
            warn!(routing_key = %key, "message was not routed to any queue");
        }
        println!(" [x] Sent {key}:{body}");
    }

    for (index, received) in join_all(handles).await?.into_iter().enumerate() {
        info!(subscriber = index + 1, received, "subscriber finished");
    }
    Ok(())
}

async fn run_subscriber(
    index: usize,
    connection: Connection,
    queue: String,
) -> Result<usize, BrokerError> {
    let mut consumer = connection.consume(&queue, ConsumeOptions::auto_ack())?;
    let mut received = 0;
    while let Ok(Some(delivery)) = timeout(IDLE, consumer.recv()).await {
        println!(
            " [{index}] {}:{}",
            delivery.routing_key(),
            String::from_utf8_lossy(delivery.payload())
        );
        received += 1;
    }
    Ok(received)
}

/// Request/reply: a server computes `fib(n)` for each request published to
/// `rpc_queue` and answers on the client's exclusive callback queue.
pub async fn rpc(broker: &Broker, requests: &[u32]) -> ScenarioResult {
    let server = broker.connect();
    server.declare_queue(RPC_QUEUE, QueueOptions::default())?;
    let consumer = server.consume(RPC_QUEUE, ConsumeOptions::default().with_prefetch(1))?;
    println!(" [*] Awaiting RPC requests");
    let handle = tokio::spawn(run_rpc_server(server, consumer));

    let client = broker.connect();
    let callback = client.declare_queue("", QueueOptions::exclusive())?;
    let mut replies = client.consume(&callback, ConsumeOptions::auto_ack())?;

    for n in requests {
        println!(" [x] Requesting fib({n})");
        let correlation_id = Uuid::new_v4().to_string();
        client.publish(
            "",
            RPC_QUEUE,
            n.to_string(),
            MessageProperties::default()
                .with_reply_to(callback.clone())
                .with_correlation_id(correlation_id.clone()),
        )?;

        let reply = loop {
            match timeout(RPC_TIMEOUT, replies.recv()).await {
                Ok(Some(delivery))
                    if delivery.properties().correlation_id.as_deref()
                        == Some(correlation_id.as_str()) =>
                {
                    break delivery
                }
                Ok(Some(delivery)) => {
                    warn!(correlation_id = ?delivery.properties().correlation_id, "discarding reply to another request");
                }
                Ok(None) => return Err("callback queue closed before the reply".into()),
                Err(_) => return Err(format!("no reply to fib({n}) within {RPC_TIMEOUT:?}").into()),
            }
        };
        println!(" [.] Got {}", String::from_utf8_lossy(reply.payload()));
    }

    // An empty request stops the server.
    client.publish("", RPC_QUEUE, Vec::new(), MessageProperties::default())?;
    let served = handle.await??;
    info!(served, "rpc server finished");
    Ok(())
}

async fn run_rpc_server(
    connection: Connection,
    mut consumer: Consumer,
) -> Result<usize, BrokerError> {
    let mut served = 0;
    while let Some(delivery) = consumer.recv().await {
        if delivery.payload().is_empty() {
            connection.ack(delivery.delivery_tag)?;
            break;
        }
        let request = String::from_utf8_lossy(delivery.payload()).into_owned();
        let n = match request.trim().parse::<u32>() {
            Ok(n) => n,
            Err(e) => {
                warn!(request = %request, error = %e, "rejecting malformed request");
                connection.nack(delivery.delivery_tag, false)?;
                continue;
            }
        };
        println!(" [.] fib({n})");

        let properties = delivery.properties();
        match &properties.reply_to {
            Some(reply_to) => {
                let mut reply = MessageProperties::default();
                reply.correlation_id = properties.correlation_id.clone();
                connection.publish("", reply_to, fib(n).to_string(), reply)?;
            }
            None => warn!(n, "request has no reply_to, dropping the answer"),
        }
        connection.ack(delivery.delivery_tag)?;
        served += 1;
    }
    Ok(served)
}

fn fib(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a.saturating_add(b));
    }
    a
}

async fn join_all(
    handles: Vec<JoinHandle<Result<usize, BrokerError>>>,
) -> Result<Vec<usize>, Box<dyn std::error::Error>> {
    let mut counts = Vec::with_capacity(handles.len());
    for handle in handles {
        counts.push(handle.await??);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fib() {
        let firsts: Vec<u64> = (0..10).map(fib).collect();
        assert_eq!(firsts, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
        assert_eq!(fib(30), 832040);
    }
}
