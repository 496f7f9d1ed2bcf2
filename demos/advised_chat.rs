use std::sync::Arc;

use advisor_pipeline::advisor::memory::CHAT_MEMORY_CONVERSATION_ID_KEY;
use advisor_pipeline::advisor::{
    InMemoryChatMemory, LoggingAdvisor, MessageMemoryAdvisor, ReReadingAdvisor, RegisteredAdvisor,
};
use advisor_pipeline::model::BackendModel;
use advisor_pipeline::{ChatClient, MockBackend};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Set OLLAMA_URL to talk to a real server; the mock answers otherwise.
    let model = match std::env::var("OLLAMA_URL") {
        Ok(url) => BackendModel::builder(url).model("llama3.2:3b").build()?,
        Err(_) => BackendModel::builder("http://localhost:11434")
            .backend(Arc::new(MockBackend::new(vec![
                "Nice to meet you, Ada.".into(),
                "You told me your name is Ada.".into(),
            ])))
            .model("mock")
            .build()?,
    };

    let client = ChatClient::builder(Arc::new(model))
        .default_system("You are a friendly assistant. Answer in one sentence.")
        .default_advisor(RegisteredAdvisor::both(MessageMemoryAdvisor::new(Arc::new(
            InMemoryChatMemory::new(),
        ))))
        .default_advisor(RegisteredAdvisor::both(LoggingAdvisor::new()))
        .build()?;

    for question in ["Hi, my name is Ada.", "What is my name?"] {
        let reply = client
            .prompt()
            .user(question)
            .advisor_param(CHAT_MEMORY_CONVERSATION_ID_KEY, "demo")
            .advisor(RegisteredAdvisor::both(ReReadingAdvisor::new().with_order(100)))
            .call()
            .await?;
        println!("> {}\n{}\n", question, reply.content());
    }

    Ok(())
}
