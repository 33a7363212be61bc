//! Runs a broker with two satellites and makes a few calls across them.
//!
//! ```bash
//! XPC_LOG=debug cargo run --bin xpc-demo -- --propagate
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xpc_broker::{
    handler_fn, Broker, BrokerConfig, CallEmitter, Dispatcher, Exposed, FailurePolicy,
    HandlerBinder, HandlerResult, MethodTable, Owner, Satellite, SatelliteConfig,
};
use xpc_core::Value;

/// Cross-context call broker demo.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deadline for every call, in milliseconds. 0 disables it.
    #[arg(long, env = "XPC_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    call_timeout_ms: u64,

    /// Report failures to callers instead of resolving them to "no result".
    #[arg(long, env = "XPC_PROPAGATE")]
    propagate: bool,

    /// Maximum number of calls routed at once.
    #[arg(long, env = "XPC_MAX_CONCURRENT_CALLS", default_value_t = 1000)]
    max_concurrent_calls: u32,

    /// Emit logs as JSON.
    #[arg(long, env = "XPC_LOG_JSON")]
    json: bool,
}

impl Args {
    fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    fn failure_policy(&self) -> FailurePolicy {
        if self.propagate {
            FailurePolicy::Propagate
        } else {
            FailurePolicy::Suppress
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("XPC_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

struct Inventory {
    items: parking_lot::Mutex<Vec<String>>,
}

impl Inventory {
    fn add(&self, params: Option<&Value>) -> HandlerResult {
        let item = params
            .and_then(Value::as_str)
            .context("add expects a string")?;
        let mut items = self.items.lock();
        items.push(item.to_string());
        Ok(Some(Value::Int(i64::try_from(items.len())?)))
    }

    fn list(&self) -> Value {
        Value::Array(self.items.lock().iter().map(|s| Value::from(s.as_str())).collect())
    }
}

impl Exposed for Inventory {
    fn type_name() -> &'static str {
        "Inventory"
    }

    fn methods() -> MethodTable<Self> {
        MethodTable::new()
            .method("add", |this: Arc<Inventory>, params| async move {
                this.add(params.as_ref())
            })
            .method_without_params("list", |this: Arc<Inventory>| async move {
                Ok(Some(this.list()))
            })
            .method_without_params("_reindex", |_| async { Ok(None) })
    }
}

async fn wait_for_owner(broker: &Broker, name: &str, owner: Owner) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.owner_of(name) != Some(owner) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| format!("{name} was never registered"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let broker = Broker::new(BrokerConfig {
        call_timeout: args.call_timeout(),
        failure_policy: args.failure_policy(),
        max_concurrent_calls: args.max_concurrent_calls,
        ..BrokerConfig::default()
    });
    let inbound = broker.start()?;

    broker.register_handler("Echo/ping", handler_fn(|params| async move { Ok(params) }))?;

    let satellite_config = SatelliteConfig {
        call_timeout: args.call_timeout(),
        failure_policy: args.failure_policy(),
        ..SatelliteConfig::default()
    };
    let storage = Satellite::connect(broker.attach(), satellite_config.clone());
    let frontend = Satellite::connect(broker.attach(), satellite_config);

    let bound = HandlerBinder::bind(
        &storage,
        Arc::new(Inventory {
            items: parking_lot::Mutex::new(Vec::new()),
        }),
    )?;
    info!(?bound, context = %storage.context_id(), "inventory bound");
    wait_for_owner(&broker, "Inventory/list", Owner::Remote(storage.context_id())).await?;

    let inventory = CallEmitter::new::<Inventory>(Arc::new(frontend.clone()));
    for item in ["anvil", "rope", "lantern"] {
        let count = inventory.call("add", Some(Value::from(item))).await?;
        info!(item, ?count, "added");
    }
    let items = inventory.call("list", None).await?;
    info!(?items, "inventory");
    let echo = frontend.invoke("Echo/ping", Some(Value::from("hello"))).await?;
    info!(?echo, "echo");
    let missing = frontend.invoke("NoSuchOp/x", None).await;
    info!(?missing, "unknown operation");
    let private = inventory.call("_reindex", None).await;
    info!(?private, "private method");

    for (name, owner) in broker.operations() {
        info!(operation = %name, owner = %owner, "registered");
    }

    frontend.shutdown().await;
    storage.shutdown().await;
    let drained = broker.shutdown(Duration::from_secs(5)).await;
    inbound.await?;
    info!(drained, "done");
    Ok(())
}
