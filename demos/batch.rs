use request_engine::{BatchRequest, RequestEngine, RequestOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let engine = RequestEngine::from_env().map_err(anyhow::Error::msg)?;

    let results = engine
        .batch::<serde_json::Value, _>([
            BatchRequest::new("/users/1"),
            BatchRequest::new("/users/2"),
            BatchRequest::new("/users/does-not-exist")
                .with_options(RequestOptions::new().retries(0)),
        ])
        .await;

    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(response) => println!("#{index}: {} {}", response.status, response.data),
            Err(err) => eprintln!(
                "#{index}: {} (status={:?}, request_id={:?})",
                err.code, err.status, err.request_id
            ),
        }
    }

    println!(
        "queued={} running={} cached={}",
        engine.queue_size(),
        engine.running_count(),
        engine.cache_size()
    );

    Ok(())
}
