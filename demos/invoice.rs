use std::time::Duration;

use keylock::{LockOptions, LockRegistry};

// Guards invoice generation per order so the same invoice is never built twice.

async fn generate_invoice(registry: &LockRegistry, order_id: &str, worker: &str) -> bool {
    let key = format!("invoice:{order_id}");
    let options = LockOptions::new()
        .timeout(Duration::from_secs(10))
        .owner(worker)
        .meta("order", order_id);

    if !registry.acquire(&key, options) {
        println!("{worker}: invoice for {order_id} is already being generated");
        return false;
    }

    println!("{worker}: generating invoice for {order_id}");
    tokio::time::sleep(Duration::from_millis(200)).await;

    registry.release(&key, Some(worker));
    println!("{worker}: invoice for {order_id} done");
    true
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let registry = LockRegistry::new();

    let (first, second) = tokio::join!(
        generate_invoice(&registry, "ORD-1001", "w1"),
        generate_invoice(&registry, "ORD-1001", "w2"),
    );
    println!("w1 generated: {first}, w2 generated: {second}");

    // A foreign release is refused
    let key = "invoice:ORD-1002";
    registry.acquire(key, LockOptions::new().owner("w1"));
    registry.release(key, Some("w2"));
    if let Some(info) = registry.info(key) {
        println!("{key} still held by {:?}", info.owner);
    }
    registry.release(key, Some("w1"));

    println!("Locked keys: {:?}", registry.list_keys());
}
