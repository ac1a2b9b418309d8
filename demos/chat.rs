//! Group chat between in-process nodes
//!
//! Every node subscribes to the chat prefix and prints what it receives. Lines typed on stdin
//! are published by the first node, or by another node when prefixed with `@name `.
//!
//! ## Usage
//!
//!     cargo run --example chat --features=examples -- --nodes alice bob carol

use std::{collections::HashMap, sync::Arc};

use clap::Parser;
use n0_snafu::Result;
use rand::rngs::OsRng;
use svs_pubsub::{
    Name, PubSub, PublishOptions,
    memory::MemoryNetwork,
    net::Options,
    security::{Ed25519Signer, SecurityOptions, TrustedKeysValidator, Validator},
};

#[derive(Parser, Debug)]
struct Args {
    /// Prefix of the sync group.
    #[clap(long, default_value = "/ndn/svs")]
    prefix: String,
    /// Names of the chat members.
    #[clap(long, num_args = 1.., default_values = ["alice", "bob"])]
    nodes: Vec<String>,
    /// Deliver messages without checking signatures.
    #[clap(long)]
    no_validation: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let group: Name = args.prefix.parse()?;
    let chat = Name::from("/chat");

    let signers: Vec<_> = args
        .nodes
        .iter()
        .map(|_| Ed25519Signer::generate(&mut OsRng))
        .collect();
    let validator = TrustedKeysValidator::new(signers.iter().map(Ed25519Signer::verifying_key));

    let network = MemoryNetwork::new();
    let mut members: HashMap<String, PubSub> = HashMap::new();
    for (id, signer) in args.nodes.iter().zip(signers) {
        let mut options = Options::new(group.clone().join(id.as_str()));
        options.security = SecurityOptions {
            signer: Arc::new(signer),
            encapsulated_validator: (!args.no_validation)
                .then(|| Arc::new(validator.clone()) as Arc<dyn Validator>),
        };
        let pubsub = network.join(options, |_| {});
        let me = id.clone();
        pubsub
            .subscribe_to_prefix(chat.clone(), move |packet| {
                let text = String::from_utf8_lossy(&packet.data.content);
                println!("[{me}] {} : {text}", packet.producer);
            })
            .await?;
        println!("> SVS client started: {}", pubsub.me());
        members.insert(id.clone(), pubsub);
    }

    for id in &args.nodes {
        let message = format!("User {id} has joined the groupchat");
        publish(&members[id], &chat, id, message).await?;
    }

    // spawn an input thread that reads stdin
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel(1);
    std::thread::spawn(move || input_loop(line_tx));

    let default = &args.nodes[0];
    while let Some(line) = line_rx.recv().await {
        let line = line.trim_end().to_string();
        let (id, text) = match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
            Some((id, text)) if members.contains_key(id) => (id.to_string(), text.to_string()),
            _ => (default.clone(), line),
        };
        publish(&members[&id], &chat, &id, text).await?;
    }
    Ok(())
}

async fn publish(pubsub: &PubSub, chat: &Name, id: &str, text: String) -> Result<()> {
    let name = chat
        .clone()
        .join(id)
        .join(rand::random::<u64>().to_string());
    pubsub
        .publish(name, text, PublishOptions::default())
        .await?;
    Ok(())
}

fn input_loop(line_tx: tokio::sync::mpsc::Sender<String>) {
    let mut buffer = String::new();
    let stdin = std::io::stdin();
    loop {
        buffer.clear();
        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if line_tx.blocking_send(buffer.clone()).is_err() {
                    break;
                }
            }
        }
    }
}
