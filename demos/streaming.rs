//! Streaming demo - a gateway and a client in one process.
//!
//! This example demonstrates:
//! - A plain request/response call
//! - A streaming result consumed chunk by chunk
//! - Downloading a blob returned by a procedure
//! - Uploading a blob as the call payload
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=callwire=debug cargo run --example streaming
//! ```

use std::time::Duration;

use callwire::handler::ProcedureRegistry;
use callwire::{
    ClientBuilder, ErrorCode, Gateway, OutgoingValue, ProtocolBlob, ProtocolError,
};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, Debug)]
struct CountInput {
    count: usize,
}

#[derive(Serialize, Debug)]
struct Greeting {
    message: String,
}

fn procedures() -> ProcedureRegistry {
    let mut procedures = ProcedureRegistry::new();

    procedures
        .typed("greet", |name: String, _ctx| async move {
            Ok::<_, ProtocolError>(Greeting {
                message: format!("Hello, {name}!"),
            })
        })
        .stream("count", |payload, _ctx| {
            let count = payload
                .deserialize::<CountInput>()
                .map(|input| input.count)
                .unwrap_or(0);
            stream::iter(0..count).then(|index| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!({ "index": index }))
            })
        })
        .procedure("report", |_payload, _ctx| async {
            let report = "id,total\n".to_string()
                + &(1..=500).map(|i| format!("{i},{}\n", i * 3)).collect::<String>();
            Ok(ProtocolBlob::from_text(report)
                .with_content_type("text/csv")
                .with_filename("report.csv")
                .into())
        })
        .procedure("word-count", |payload, _ctx| async move {
            let reader = payload.into_blob().ok_or_else(|| {
                ProtocolError::new(ErrorCode::ValidationError, "Expected a blob")
            })?;
            let text = reader.text().await.map_err(ProtocolError::from)?;
            Ok::<OutgoingValue, ProtocolError>(json!(text.split_whitespace().count()).into())
        });

    procedures
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callwire=info")),
        )
        .init();

    let gateway = Gateway::builder(procedures()).build();

    // Any AsyncRead + AsyncWrite pair works, a TCP stream included
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.serve("demo", server_io).await }
    });

    let client = ClientBuilder::new().chunk_size(1024).connect_stream(client_io);

    // Plain call
    let greeting = client.call("greet", json!("world")).await?.into_value()?;
    println!("greet -> {}", greeting.into_plain()?);

    // Streaming result: each chunk is pulled as the loop asks for it
    let mut counts = client.call("count", json!({ "count": 5 })).await?.into_stream()?;
    while let Some(chunk) = counts.next().await {
        println!("count -> {}", chunk?);
    }

    // Download: the result carries a blob read in pulled chunks
    let mut report = client
        .call("report", json!(null))
        .await?
        .into_value()?
        .into_blob()
        .ok_or("report did not return a blob")?;
    println!(
        "report -> {:?} ({:?} bytes)",
        report.metadata().filename,
        report.metadata().size
    );
    let mut received = 0;
    while let Some(chunk) = report.next_chunk().await? {
        received += chunk.len();
    }
    println!("report -> received {received} bytes");

    // Upload: the payload itself is a blob the server pulls
    let words = client
        .call(
            "word-count",
            ProtocolBlob::from_text("the quick brown fox jumps over the lazy dog"),
        )
        .await?
        .into_value()?;
    println!("word-count -> {}", words.into_plain()?);

    client.close("done");
    gateway.shutdown();
    server.await??;

    Ok(())
}
