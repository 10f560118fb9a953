/// Example client for exercising a running Mini Load Balancer
///
/// Usage:
///   cargo run --example mini_lb_client -- http://localhost:8000

use futures_util::StreamExt;
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let lb_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8000".to_string());
    let client = reqwest::Client::new();

    println!("Testing Mini Load Balancer at {}", lb_url);

    println!("\n1. GET /health");
    let health = client.get(format!("{}/health", lb_url)).send().await?;
    println!("   Status: {}", health.status());

    println!("\n2. POST /generate (batched text)");
    let resp = client
        .post(format!("{}/generate", lb_url))
        .json(&json!({
            "text": ["Once upon a time", "The capital of France is"],
            "sampling_params": {"temperature": 0.0, "max_new_tokens": 16},
        }))
        .send()
        .await?;
    println!("   Status: {}", resp.status());
    let body: Value = resp.json().await?;
    println!("   Response: {}", serde_json::to_string_pretty(&body)?);

    println!("\n3. POST /v1/chat/completions (streaming)");
    let resp = client
        .post(format!("{}/v1/chat/completions", lb_url))
        .json(&json!({
            "model": "default",
            "messages": [{"role": "user", "content": "Count from 1 to 5."}],
            "max_tokens": 32,
            "stream": true,
        }))
        .send()
        .await?;
    println!("   Status: {}", resp.status());
    let mut stream = Box::pin(resp.bytes_stream());
    while let Some(chunk) = stream.next().await {
        print!("   {}", String::from_utf8_lossy(&chunk?));
    }

    println!("\n4. POST /start_profile then /stop_profile");
    for path in ["start_profile", "start_profile", "stop_profile"] {
        let outcome: Value = client
            .post(format!("{}/{}", lb_url, path))
            .send()
            .await?
            .json()
            .await?;
        println!("   /{}: {}", path, outcome);
    }

    println!("\nAll requests completed!");

    Ok(())
}
