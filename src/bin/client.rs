//! Terminal client for the `BookSummary` stream.
//!
//! ```bash
//! cargo run --bin client                          # http://127.0.0.1:50051
//! cargo run --bin client -- http://server:50051
//! ```

use tonic::Request;
use tracing::{info, warn};

use orderbook_aggregator::grpc::proto::orderbook_aggregator_client::OrderbookAggregatorClient;
use orderbook_aggregator::grpc::proto::{self, Summary};

const DEFAULT_ADDR: &str = "http://127.0.0.1:50051";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_ADDR.to_string());
    info!(%addr, "Connecting");

    let mut client = OrderbookAggregatorClient::connect(addr).await?;
    let mut inbound = client
        .book_summary(Request::new(proto::Empty {}))
        .await?
        .into_inner();

    while let Some(summary) = inbound.message().await? {
        print!("{}", render(&summary));
    }

    warn!("Server closed the stream");
    Ok(())
}

/// Clear the screen, then the spread and one bid/ask row per level
fn render(summary: &Summary) -> String {
    let mut out = String::from("\x1b[2J\x1b[H");
    match summary.spread {
        Some(spread) => out.push_str(&format!("Spread: {spread:.8}\n")),
        None => out.push_str("Spread: -\n"),
    }
    out.push_str(&"-".repeat(79));
    out.push('\n');

    let rows = summary.bids.len().max(summary.asks.len());
    for i in 0..rows {
        let bid = summary
            .bids
            .get(i)
            .map(|l| format!("{:<10} {:>14.6} {:>12.8}", l.exchange, l.amount, l.price))
            .unwrap_or_default();
        let ask = summary
            .asks
            .get(i)
            .map(|l| format!("{:<12.8} {:<14.6} {:>10}", l.price, l.amount, l.exchange))
            .unwrap_or_default();
        out.push_str(&format!("{bid:<38} | {ask}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(exchange: &str, price: f64, amount: f64) -> proto::Level {
        proto::Level {
            exchange: exchange.to_string(),
            price,
            amount,
        }
    }

    #[test]
    fn test_render_pairs_uneven_sides() {
        let summary = Summary {
            spread: Some(0.0001),
            bids: vec![level("binance", 0.068, 5.0), level("bitstamp", 0.0679, 1.0)],
            asks: vec![level("bitstamp", 0.0681, 2.0)],
        };
        let text = render(&summary);
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].ends_with("Spread: 0.00010000"));
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("binance") && lines[2].contains("bitstamp"));
        assert!(lines[3].contains("bitstamp") && lines[3].trim_end().ends_with('|'));
    }

    #[test]
    fn test_render_without_spread() {
        let text = render(&Summary::default());
        assert!(text.contains("Spread: -"));
        assert_eq!(text.lines().count(), 2);
    }
}
