use std::time::Duration;

use request_engine::{RequestEngine, RequestOptions};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Todo {
    id: u64,
    title: String,
    completed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let engine = RequestEngine::from_env().map_err(anyhow::Error::msg)?;

    let cached = RequestOptions::new()
        .cache(true)
        .cache_ttl(Duration::from_secs(30));

    let todo = engine.get::<Todo>("/todos/1", cached.clone()).await?;
    println!("{} {:?} (status {})", todo.data.id, todo.data.title, todo.status);

    let again = engine.get::<Todo>("/todos/1", cached).await?;
    println!("cached: completed={}", again.data.completed);

    let created = engine
        .post::<serde_json::Value, _>(
            "/todos",
            &serde_json::json!({ "title": "write docs", "completed": false }),
            RequestOptions::new(),
        )
        .await?;
    println!("created: {}", created.data);

    let health = engine.health_check("/").await;
    println!("health: {:?} in {}ms", health.status, health.response_time);

    Ok(())
}
