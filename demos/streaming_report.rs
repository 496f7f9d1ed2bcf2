use std::io::Write;
use std::sync::Arc;

use advisor_pipeline::advisor::{LoggingAdvisor, RegisteredAdvisor};
use advisor_pipeline::aggregator::with_completion;
use advisor_pipeline::decoder::{FieldKind, Shape, StructuredDecoder};
use advisor_pipeline::model::BackendModel;
use advisor_pipeline::{AdvisedRequest, AdvisorChain, MockBackend};
use futures::StreamExt;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Report {
    title: String,
    suggestions: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let shape = Shape::new("Report")
        .describe("Advice for a team that ships late")
        .field("title", FieldKind::String)
        .field("suggestions", FieldKind::list(FieldKind::String));
    let decoder = StructuredDecoder::new(shape);

    let mock = MockBackend::fixed(
        "{\"title\": \"Shipping on time\", \"suggestions\": [\"cut scope\", \"release weekly\"]}",
    )
    .with_chunk_size(8);
    let model = BackendModel::builder("http://localhost:11434")
        .backend(Arc::new(mock))
        .model("mock")
        .build()?;

    let chain = AdvisorChain::builder(Arc::new(model))
        .advisor(RegisteredAdvisor::both(LoggingAdvisor::new()))
        .build()?;

    let request = AdvisedRequest::new("Our team keeps missing deadlines. What should we do?")
        .with_system(decoder.augment_system("You are an engineering manager."));

    let (mut stream, completion) = with_completion(chain.stream(request));
    while let Some(fragment) = stream.next().await {
        print!("{}", fragment?.text);
        std::io::stdout().flush()?;
    }
    println!();

    if let Some(response) = completion.wait().await {
        let report: Report = decoder.decode(&response.text)?;
        println!("\n{}", report.title);
        for suggestion in &report.suggestions {
            println!("  - {}", suggestion);
        }
    }

    Ok(())
}
