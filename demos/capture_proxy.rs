//! Capture proxy that prints every exchange as it completes
//!
//! To run:
//! ```bash
//! RUST_LOG=slinger_capture=debug cargo run --example capture_proxy -- 127.0.0.1:8080
//! ```
//!
//! Then point a client at it, trusting the exported CA:
//! ```bash
//! curl --proxy http://127.0.0.1:8080 --cacert capture-ca.pem https://example.com/
//! ```
//! Press Enter to stop the proxy.

use slinger_capture::{CaptureConfig, CaptureServer, CapturedRequest};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let listen = std::env::args()
    .nth(1)
    .unwrap_or_else(|| "127.0.0.1:8080".to_string());
  let config = CaptureConfig::default().listen_addr(listen);
  let server = CaptureServer::new(config).await?;

  let ca_path = server.export_ca_cert("capture-ca.pem").await?;
  println!("CA certificate written to {}", ca_path.display());

  server.add_listener(|capture: &Arc<CapturedRequest>| {
    let status = capture
      .status
      .map(|s| s.as_u16().to_string())
      .unwrap_or_else(|| "---".to_string());
    println!(
      "#{:<4} {} {:<7} {} ({} bytes, {:?}){}",
      capture.id,
      status,
      capture.method,
      capture.url,
      capture.response_body.total_len,
      capture.duration,
      if capture.tls { " [tls]" } else { "" }
    );
    if let Some(error) = &capture.error {
      println!("      error: {}", error);
    }
  });

  let addr = server.start().await?;
  println!("Capture proxy listening on http://{}", addr);

  tokio::task::spawn_blocking(|| {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)
  })
  .await??;

  server.stop().await;
  if let Some(last) = server.captures().last() {
    println!("\nreplay the last capture with:\n{}", last.curl_command());
  }
  Ok(())
}
