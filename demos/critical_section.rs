use std::time::Duration;

use keylock::{LockOptions, LockRegistry};
use tokio::task;

// Several workers want to run the same job. Only one may run it at a time,
// the others back off and try again.

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let registry = LockRegistry::new();
    let resource = "nightly-report";

    let workers: Vec<_> = (1..=4)
        .map(|worker| {
            let registry = registry.clone();
            task::spawn(async move {
                let options = LockOptions::new()
                    .owner(format!("worker-{worker}"))
                    .timeout(Duration::from_secs(5));

                if !registry
                    .retry_acquire(resource, 4, Duration::from_millis(50), options)
                    .await
                {
                    println!("worker-{worker} gave up");
                    return;
                }

                println!("worker-{worker} entered the critical section");
                tokio::time::sleep(Duration::from_millis(120)).await;
                registry.release(resource, Some(&format!("worker-{worker}")));
                println!("worker-{worker} left the critical section");
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.await;
    }

    // Wait for whatever may still hold the job, then show the registry is empty
    registry
        .wait_for_release(resource, Duration::from_millis(100))
        .await;
    println!("Locks still held: {}", registry.count());
}
