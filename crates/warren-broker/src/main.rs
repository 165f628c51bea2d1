use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use warren_broker::{logging, Broker, BrokerConfig};

mod scenarios;

#[derive(Parser, Debug)]
#[command(version, about = "Runs the messaging tutorials against an in-process broker", long_about = None)]
struct Cli {
    /// TOML configuration file; `WARREN__*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Send one message to the `hello` queue and receive it
    Hello {
        #[arg(default_value = "Hello World!")]
        message: String,
    },
    /// Competing workers on a durable queue
    WorkQueue {
        #[arg(long, default_value_t = 2)]
        workers: usize,

        /// Milliseconds of work per dot in a task body
        #[arg(long, default_value_t = 100)]
        work_ms: u64,

        #[arg(default_values_t = [
            "First message.".to_string(),
            "Second message..".to_string(),
            "Third message...".to_string(),
            "Fourth message....".to_string(),
            "Fifth message.....".to_string(),
        ])]
        tasks: Vec<String>,
    },
    /// Broadcast over a fanout exchange
    Pubsub {
        #[arg(long, default_value_t = 2)]
        subscribers: usize,

        #[arg(default_values_t = ["info: Hello World!".to_string()])]
        messages: Vec<String>,
    },
    /// Direct exchange keyed by severity
    Routing {
        /// Comma separated severities, one flag per subscriber
        #[arg(long = "subscriber", default_values_t = ["error".to_string(), "info,warning,error".to_string()])]
        subscribers: Vec<String>,

        /// Messages as `severity:body`
        #[arg(default_values_t = [
            "error:Run. Run. Or it will explode.".to_string(),
            "warning:Disk almost full".to_string(),
            "info:Started".to_string(),
        ])]
        messages: Vec<String>,
    },
    /// Topic exchange keyed by `<facility>.<severity>` patterns
    Topics {
        /// Comma separated binding patterns, one flag per subscriber
        #[arg(long = "subscriber", default_values_t = ["*.orange.*".to_string(), "*.*.rabbit,lazy.#".to_string()])]
        subscribers: Vec<String>,

        /// Messages as `routing.key:body`
        #[arg(default_values_t = [
            "quick.orange.rabbit:both".to_string(),
            "lazy.orange.elephant:both".to_string(),
            "quick.orange.fox:first".to_string(),
            "lazy.brown.fox:second".to_string(),
            "lazy.pink.rabbit:second once".to_string(),
            "quick.brown.fox:nobody".to_string(),
        ])]
        messages: Vec<String>,
    },
    /// Request/reply computing fib(n) over a callback queue
    Rpc {
        #[arg(default_values_t = [30u32])]
        requests: Vec<u32>,
    },
}

fn split_patterns(subscribers: &[String]) -> Vec<Vec<String>> {
    subscribers
        .iter()
        .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
        .collect()
}

fn split_messages(messages: &[String]) -> Vec<(String, String)> {
    messages
        .iter()
        .map(|m| match m.split_once(':') {
            Some((key, body)) => (key.to_string(), body.trim().to_string()),
            None => (String::new(), m.clone()),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Err(e) = logging::init(&cli.log_level) {
        eprintln!("failed to initialise logging: {e}");
    }

    let config = BrokerConfig::load(cli.config.as_deref())?;
    let broker = Broker::open(config)?;

    let result = match &cli.scenario {
        Scenario::Hello { message } => scenarios::hello(&broker, message).await,
        Scenario::WorkQueue {
            workers,
            work_ms,
            tasks,
        } => scenarios::work_queue(&broker, *workers, tasks, *work_ms).await,
        Scenario::Pubsub {
            subscribers,
            messages,
        } => scenarios::pubsub(&broker, *subscribers, messages).await,
        Scenario::Routing {
            subscribers,
            messages,
        } => {
            scenarios::routing(
                &broker,
                &split_patterns(subscribers),
                &split_messages(messages),
            )
            .await
        }
        Scenario::Topics {
            subscribers,
            messages,
        } => {
            scenarios::topics(
                &broker,
                &split_patterns(subscribers),
                &split_messages(messages),
            )
            .await
        }
        Scenario::Rpc { requests } => scenarios::rpc(&broker, requests).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "scenario failed");
    }
    broker.shutdown()?;
    result
}
