use std::sync::Arc;
use std::time::Duration;

use moat_keeper::Context;
use moat_keeper::MoatError;
use moat_keeper::MoatKeeper;
use moat_keeper::ResourceId;
use moat_keeper::config::ConcurrentLimitConfig;
use moat_keeper::config::ExternalConfig;
use moat_keeper::config::InMemoryConfigSource;
use moat_keeper::config::ResourceConfig;
use tokio::time::sleep;

#[tokio::main]
async fn main() {
    // 1. Baseline: at most 20 calls in flight
    let id = ResourceId::method("inventory");
    let source = Arc::new(InMemoryConfigSource::new());
    let keeper = MoatKeeper::builder()
        .baseline(
            id.clone(),
            ResourceConfig::new().with_concurrent(ConcurrentLimitConfig::new(20)),
        )
        .config_source(source.clone())
        .build()
        .unwrap();

    // 2. Push overrides every 50ms
    let refresher = keeper.spawn_refresher(Duration::from_millis(50));

    println!("🚀 Starting Stress Test...");
    println!("Moat: Concurrent (baseline 20, override 5 after the first wave)\n");

    for wave in 0..2 {
        if wave == 1 {
            source.set_config(
                id.clone(),
                ExternalConfig {
                    max_concurrent_limit: Some(5),
                    ..ExternalConfig::default()
                },
            );
            sleep(Duration::from_millis(100)).await;
        }

        // 3. Fire 50 requests instantly
        let mut tasks = Vec::new();
        for i in 0..50 {
            let keeper = keeper.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let res = keeper
                    .execute_async(Context::new(id), || async {
                        // Simulate a tiny bit of processing time
                        sleep(Duration::from_millis(10)).await;
                        Ok("Request Successful")
                    })
                    .await;
                match res {
                    Ok(resp) => println!("[{wave}:{i:02}] ✅ {resp}"),
                    Err(MoatError::NotPermitted { reason, .. }) => {
                        println!("[{wave}:{i:02}] ❌ Rejected: {reason}")
                    }
                    Err(e) => println!("[{wave}:{i:02}] 💥 Unexpected Error: {e}"),
                }
            }));
        }

        // Wait for all requests to finish
        for task in tasks {
            let _ = task.await;
        }
        if let Some(metrics) = keeper.metrics(&id) {
            println!("\n📊 {metrics}\n");
        }
    }

    refresher.abort();
    println!("🏁 Stress test complete.");
}
